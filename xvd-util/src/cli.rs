use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use xvd::guid::Guid;
use xvd::header::OdkIndex;
use xvd_util::keyfile::parse_odk_slot;

#[derive(Debug, Parser)]
#[command(name = "xvd-util")]
#[command(about = "Xbox XVD/XVC image and XBFS NAND utility", long_about = None)]
pub struct Cli {
    /// Increase logging verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Key files shared by the commands that need them.
#[derive(Debug, Args)]
pub struct KeyArgs {
    /// ODK file (32 raw bytes)
    #[arg(long, value_name = "FILE")]
    pub odk_file: Option<PathBuf>,

    /// ODK slot to use instead of the one named by the header
    /// (standard, green, red or a number)
    #[arg(long, value_name = "SLOT", value_parser = parse_odk_slot)]
    pub odk: Option<OdkIndex>,

    /// CIK file (16-byte GUID followed by the key), may be repeated
    #[arg(long = "cik-file", value_name = "FILE")]
    pub cik_files: Vec<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Display information about an XVD file
    Info {
        /// Path to the XVD file
        #[arg(value_name = "XVD_FILE")]
        xvd_path: PathBuf,

        /// Skip checking the data pages against the hash tree
        #[arg(long)]
        no_data_verify: bool,

        /// BCRYPT RSA key to check the header signature with
        #[arg(long, value_name = "FILE")]
        sign_key: Option<PathBuf>,
    },

    /// Extract the sections of an XVD file to a directory
    Extract {
        /// Path to the XVD file
        #[arg(value_name = "XVD_FILE")]
        xvd_path: PathBuf,

        /// Output directory (defaults to the file name without extension)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Fail instead of overwriting existing files
        #[arg(long)]
        no_overwrite: bool,

        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Decrypt the user data of an XVD file
    Decrypt {
        /// Path to the XVD file
        #[arg(value_name = "XVD_FILE")]
        xvd_path: PathBuf,

        /// Write to a copy instead of modifying the file in place
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Encrypt the user data of an XVD file
    Encrypt {
        /// Path to the XVD file
        #[arg(value_name = "XVD_FILE")]
        xvd_path: PathBuf,

        /// Write to a copy instead of modifying the file in place
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// GUID of the CIK to encrypt XVC content with (defaults to the
        /// first CIK file)
        #[arg(long, value_name = "GUID")]
        cik: Option<Guid>,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Add a hash tree and compute it
    AddHashTree {
        /// Path to the XVD file
        #[arg(value_name = "XVD_FILE")]
        xvd_path: PathBuf,

        /// Write to a copy instead of modifying the file in place
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Remove the hash tree
    RemoveHashTree {
        /// Path to the XVD file
        #[arg(value_name = "XVD_FILE")]
        xvd_path: PathBuf,

        /// Write to a copy instead of modifying the file in place
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Recompute every data hash and the upper levels of the hash tree
    Rehash {
        /// Path to the XVD file
        #[arg(value_name = "XVD_FILE")]
        xvd_path: PathBuf,

        /// Write to a copy instead of modifying the file in place
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Sign the header with a private BCRYPT RSA key
    Resign {
        /// Path to the XVD file
        #[arg(value_name = "XVD_FILE")]
        xvd_path: PathBuf,

        /// Write to a copy instead of modifying the file in place
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// BCRYPT RSA private key
        #[arg(long, value_name = "FILE")]
        sign_key: PathBuf,
    },

    /// Work with XBFS NAND dumps
    #[command(subcommand)]
    Xbfs(XbfsCommand),
}

#[derive(Debug, Subcommand)]
pub enum XbfsCommand {
    /// Display the headers and files of a NAND dump
    Info {
        /// Path to the NAND dump
        #[arg(value_name = "NAND_FILE")]
        nand_path: PathBuf,
    },

    /// Extract the files of the newest valid header
    Extract {
        /// Path to the NAND dump
        #[arg(value_name = "NAND_FILE")]
        nand_path: PathBuf,

        /// Output directory
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,

        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Recompute the hash of every header copy
    Rehash {
        /// Path to the NAND dump
        #[arg(value_name = "NAND_FILE")]
        nand_path: PathBuf,
    },
}

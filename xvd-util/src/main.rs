mod cli;

use clap::Parser;
use cli::{Cli, Command, KeyArgs, XbfsCommand};
use snafu::{OptionExt, ResultExt, Snafu};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use xvd::guid::Guid;
use xvd::storage::Storage;
use xvd::{LoadOptions, XvdFile};
use xvd_util::keyfile::LoadedKeys;
use xvd_util::{ConsoleProgress, KeyFiles, SilentProgress, XvdExtractor};

/// Top-level application errors for xvd-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to open XVD file '{}'", path.display()))]
    OpenXvd {
        path: PathBuf,
        source: xvd_util::OpenXvdError,
    },

    #[snafu(display("failed to open NAND dump '{}'", path.display()))]
    OpenXbfs {
        path: PathBuf,
        source: xvd_util::OpenXbfsError,
    },

    #[snafu(display("failed to read NAND dump '{}'", path.display()))]
    ReadNand {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse NAND dump"))]
    ParseNand { source: xbfs::LoadError },

    #[snafu(display("failed to write XBFS headers"))]
    WriteXbfsHeaders { source: std::io::Error },

    #[snafu(display("failed to prepare output file"))]
    PrepareOutput {
        source: xvd_util::PrepareOutputError,
    },

    #[snafu(display("failed to load key files"))]
    LoadKeys { source: xvd_util::KeyFileError },

    #[snafu(display("failed to extract"))]
    Extract {
        source: xvd_util::ExtractError,
    },

    #[snafu(display("failed to decrypt XVD"))]
    Decrypt { source: xvd::CryptError },

    #[snafu(display("failed to encrypt XVD"))]
    Encrypt { source: xvd::CryptError },

    #[snafu(display("XVC images need a CIK to encrypt with, pass --cik-file"))]
    NoCikGiven,

    #[snafu(display("failed to update hash tree"))]
    HashTree { source: xvd::HashTreeError },

    #[snafu(display("failed to sign XVD"))]
    Sign { source: xvd::SignError },

    #[snafu(display("file name of '{}' has no stem", path.display()))]
    NoFileStem { path: PathBuf },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Command::Info {
            xvd_path,
            no_data_verify,
            sign_key,
        } => cmd_info(&xvd_path, !no_data_verify, sign_key),
        Command::Extract {
            xvd_path,
            output,
            no_overwrite,
            quiet,
        } => cmd_extract(&xvd_path, output.as_deref(), no_overwrite, quiet),
        Command::Decrypt {
            xvd_path,
            output,
            keys,
        } => cmd_decrypt(&xvd_path, output.as_deref(), keys),
        Command::Encrypt {
            xvd_path,
            output,
            cik,
            keys,
        } => cmd_encrypt(&xvd_path, output.as_deref(), cik, keys),
        Command::AddHashTree { xvd_path, output } => {
            cmd_add_hash_tree(&xvd_path, output.as_deref())
        }
        Command::RemoveHashTree { xvd_path, output } => {
            cmd_remove_hash_tree(&xvd_path, output.as_deref())
        }
        Command::Rehash { xvd_path, output } => cmd_rehash(&xvd_path, output.as_deref()),
        Command::Resign {
            xvd_path,
            output,
            sign_key,
        } => cmd_resign(&xvd_path, output.as_deref(), sign_key),
        Command::Xbfs(XbfsCommand::Info { nand_path }) => cmd_xbfs_info(&nand_path),
        Command::Xbfs(XbfsCommand::Extract {
            nand_path,
            output,
            quiet,
        }) => cmd_xbfs_extract(&nand_path, &output, quiet),
        Command::Xbfs(XbfsCommand::Rehash { nand_path }) => cmd_xbfs_rehash(&nand_path),
    }
}

/// Logs to stderr. `RUST_LOG` overrides the level picked by `-v`.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open(path: &Path, writable: bool, options: LoadOptions) -> Result<XvdFile<std::fs::File>> {
    xvd_util::open_xvd(path, writable, options).context(OpenXvdSnafu { path })
}

/// Copies `input` to `output` when given and opens the result for writing.
/// Data hashes are not checked since every mutation rechecks what it needs.
fn open_for_update(input: &Path, output: Option<&Path>) -> Result<XvdFile<std::fs::File>> {
    let path = xvd_util::prepare_output(input, output).context(PrepareOutputSnafu)?;
    open(&path, true, LoadOptions { verify_data: false })
}

fn load_keys<S: Storage>(xvd: &XvdFile<S>, args: KeyArgs) -> Result<LoadedKeys> {
    let slot = args.odk.unwrap_or(xvd.header().odk_keyslot_id());

    KeyFiles {
        odk: args.odk_file.map(|path| (slot, path)),
        ciks: args.cik_files,
        sign_key: None,
    }
    .load()
    .context(LoadKeysSnafu)
}

fn cmd_info(path: &Path, verify_data: bool, sign_key: Option<PathBuf>) -> Result<()> {
    let xvd = open(path, false, LoadOptions { verify_data })?;
    let header = xvd.header();
    let layout = xvd.layout();

    println!("XVD: {}", path.display());
    println!();
    println!("Type:           {}", header.xvd_type());
    println!("Content Type:   {}", header.content_type());
    println!("Volume Flags:   {}", header.volume_flags());
    println!("Format Version: {}", header.format_version());
    println!("Sequence:       {}", header.sequence_number());
    println!("Drive Size:     {} bytes", header.drive_size());
    println!("VDUID:          {}", header.vduid());
    println!("UVUID:          {}", header.uvuid());
    println!("PDUID:          {}", header.pduid());
    println!("Product ID:     {}", header.product_id());
    println!("Sandbox ID:     {}", header.sandbox_id());
    println!("ODK Slot:       {}", header.odk_keyslot_id());
    println!("Encrypted:      {}", header.is_encrypted());
    println!("Integrity:      {}", header.is_data_integrity_enabled());

    let [major, minor, build, revision] = header.package_version();
    println!("Package Ver:    {major}.{minor}.{build}.{revision}");

    println!();
    println!("Sections:");
    println!(
        "  Embedded XVD: 0x{:X} ({} bytes)",
        layout.embedded_xvd_offset,
        header.embedded_xvd_length()
    );
    println!(
        "  Mutable Data: 0x{:X} ({} pages)",
        layout.mutable_data_offset,
        header.mutable_data_page_count()
    );
    println!(
        "  Hash Tree:    0x{:X} ({} pages, {} levels)",
        layout.hash_tree_offset, layout.hash_tree_page_count, layout.hash_tree_levels
    );
    println!(
        "  User Data:    0x{:X} ({} bytes)",
        layout.user_data_offset,
        header.user_data_length()
    );
    println!(
        "  XVC Info:     0x{:X} ({} bytes)",
        layout.xvc_info_offset,
        header.xvc_data_length()
    );
    println!(
        "  Dynamic Hdr:  0x{:X} ({} bytes)",
        layout.dynamic_header_offset,
        header.dynamic_header_length()
    );
    println!("  Drive Data:   0x{:X}", layout.drive_data_offset);

    if let Some(xvc) = xvd.xvc() {
        println!();
        println!("XVC:");
        println!("  Content ID:   {}", xvc.info.content_id());
        println!("  Description:  {}", xvc.info.description());
        println!("  Version:      {}", xvc.info.version());

        for (i, key) in xvc.info.key_ids().iter().enumerate() {
            println!("  Key #{i}:       {key}");
        }

        println!();
        println!(
            "{:>5}  {:<32}  {:>6}  {:>12}  {:>12}  Flags",
            "Index", "ID", "Key", "Offset", "Length"
        );
        println!(
            "{:-<5}  {:-<32}  {:-<6}  {:-<12}  {:-<12}  {:-<10}",
            "", "", "", "", "", ""
        );

        for (i, region) in xvc.regions.iter().enumerate() {
            println!(
                "{:>5}  {:<32}  0x{:04X}  0x{:010X}  0x{:010X}  {}",
                i,
                region.id().to_string(),
                region.key_id(),
                region.offset(),
                region.length(),
                region.flags()
            );
        }
    }

    println!();

    if header.is_data_integrity_enabled() {
        println!("Hash Tree:      {}", validity(xvd.is_hash_tree_valid()));

        match xvd.invalid_data_pages() {
            None => println!("Data Hashes:    not checked"),
            Some([]) => println!("Data Hashes:    valid"),
            Some(pages) => {
                println!("Data Hashes:    {} invalid pages", pages.len());
                for page in pages.iter().take(16) {
                    println!("  page {page}");
                }
                if pages.len() > 16 {
                    println!("  ...");
                }
            }
        }
    } else {
        println!("Hash Tree:      none");
    }

    if let Some(key_path) = sign_key {
        let keys = KeyFiles {
            sign_key: Some(key_path),
            ..Default::default()
        }
        .load()
        .context(LoadKeysSnafu)?;

        if let Some(name) = &keys.sign_key {
            let valid = xvd.verify_signature(&keys.store, name).context(SignSnafu)?;
            println!("Signature:      {} ({name})", validity(valid));
        }
    }

    Ok(())
}

fn validity(valid: bool) -> &'static str {
    if valid { "valid" } else { "INVALID" }
}

fn cmd_extract(
    path: &Path,
    output: Option<&Path>,
    no_overwrite: bool,
    quiet: bool,
) -> Result<()> {
    let mut xvd = open(path, false, LoadOptions { verify_data: false })?;

    let output_dir = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let stem = path.file_stem().context(NoFileStemSnafu { path })?;
            path.with_file_name(stem)
        }
    };

    if !quiet {
        println!(
            "Extracting {} to {}...",
            path.display(),
            output_dir.display()
        );
    }

    let start = std::time::Instant::now();

    if quiet {
        let mut extractor = XvdExtractor::new(&mut xvd, SilentProgress);
        if no_overwrite {
            extractor = extractor.no_overwrite();
        }
        extractor.extract(&output_dir).context(ExtractSnafu)?;
    } else {
        let mut extractor = XvdExtractor::new(&mut xvd, ConsoleProgress::new());
        if no_overwrite {
            extractor = extractor.no_overwrite();
        }
        extractor.extract(&output_dir).context(ExtractSnafu)?;
    }

    if !quiet {
        println!("Done in {:.2}s.", start.elapsed().as_secs_f64());
    }

    Ok(())
}

fn cmd_decrypt(path: &Path, output: Option<&Path>, args: KeyArgs) -> Result<()> {
    let mut xvd = open_for_update(path, output)?;
    let odk = args.odk;
    let keys = load_keys(&xvd, args)?;

    xvd.decrypt(&keys.store, odk).context(DecryptSnafu)?;
    println!("Decrypted.");

    Ok(())
}

fn cmd_encrypt(
    path: &Path,
    output: Option<&Path>,
    cik: Option<Guid>,
    args: KeyArgs,
) -> Result<()> {
    let mut xvd = open_for_update(path, output)?;
    let odk = args.odk;
    let keys = load_keys(&xvd, args)?;

    let cik = if xvd.header().content_type().is_xvc() {
        Some(cik.or(keys.ciks.first().copied()).context(NoCikGivenSnafu)?)
    } else {
        None
    };

    xvd.encrypt(&keys.store, cik, odk).context(EncryptSnafu)?;
    println!("Encrypted.");

    Ok(())
}

fn cmd_add_hash_tree(path: &Path, output: Option<&Path>) -> Result<()> {
    let mut xvd = open_for_update(path, output)?;

    if xvd.add_hash_tree().context(HashTreeSnafu)? {
        let pages = xvd.rehash_data().context(HashTreeSnafu)?;
        println!("Added hash tree ({pages} pages hashed).");
    } else {
        println!("Hash tree already present.");
    }

    Ok(())
}

fn cmd_remove_hash_tree(path: &Path, output: Option<&Path>) -> Result<()> {
    let mut xvd = open_for_update(path, output)?;

    if xvd.remove_hash_tree().context(HashTreeSnafu)? {
        println!("Removed hash tree.");
    } else {
        println!("No hash tree to remove.");
    }

    Ok(())
}

fn cmd_rehash(path: &Path, output: Option<&Path>) -> Result<()> {
    let mut xvd = open_for_update(path, output)?;
    let pages = xvd.rehash_data().context(HashTreeSnafu)?;

    println!("Rehashed {pages} pages.");

    Ok(())
}

fn cmd_resign(path: &Path, output: Option<&Path>, sign_key: PathBuf) -> Result<()> {
    let mut xvd = open_for_update(path, output)?;

    let keys = KeyFiles {
        sign_key: Some(sign_key),
        ..Default::default()
    }
    .load()
    .context(LoadKeysSnafu)?;

    if let Some(name) = &keys.sign_key {
        xvd.resign(&keys.store, name).context(SignSnafu)?;
        println!("Signed with '{name}'.");
    }

    Ok(())
}

fn cmd_xbfs_info(path: &Path) -> Result<()> {
    let xbfs = unsafe { xvd_util::open_xbfs(path).context(OpenXbfsSnafu { path })? };
    let offsets = xbfs.flavor().header_offsets();

    println!("NAND: {} ({})", path.display(), xbfs.flavor());
    println!();

    for (i, (header, offset)) in xbfs.headers().iter().zip(offsets).enumerate() {
        let newest = if xbfs.newest_header_index() == Some(i) {
            " (newest)"
        } else {
            ""
        };

        println!("Header #{i} at 0x{offset:X}{newest}:");
        println!("  Magic:        {}", validity(header.is_valid()));
        println!("  Hash:         {}", validity(header.is_hash_valid()));
        println!("  Format:       {}", header.format_version());
        println!("  Sequence:     {}", header.sequence_number());
        println!("  Layout:       {}", header.layout_version());
        println!("  System XVID:  {}", Guid::from_bytes(header.system_xvid()));
    }

    println!();
    println!("{:>5}  {:<20}  {:>12}  {:>12}", "Index", "Name", "Offset", "Size");
    println!("{:-<5}  {:-<20}  {:-<12}  {:-<12}", "", "", "", "");

    for file in xbfs.files() {
        println!(
            "{:>5}  {:<20}  0x{:010X}  {:>12}",
            file.index,
            file.name,
            file.entry.offset(),
            file.entry.byte_len()
        );
    }

    Ok(())
}

fn cmd_xbfs_extract(path: &Path, output: &Path, quiet: bool) -> Result<()> {
    let xbfs = unsafe { xvd_util::open_xbfs(path).context(OpenXbfsSnafu { path })? };

    if quiet {
        xvd_util::extract_xbfs(&xbfs, output, &SilentProgress).context(ExtractSnafu)?;
    } else {
        println!("Extracting {} to {}...", path.display(), output.display());
        xvd_util::extract_xbfs(&xbfs, output, &ConsoleProgress::new()).context(ExtractSnafu)?;
    }

    Ok(())
}

fn cmd_xbfs_rehash(path: &Path) -> Result<()> {
    let data = std::fs::read(path).context(ReadNandSnafu { path })?;
    let mut xbfs = xbfs::Xbfs::new(data).context(ParseNandSnafu)?;

    xbfs.rehash_headers();

    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .context(ReadNandSnafu { path })?;
    xbfs.write_headers(&mut file).context(WriteXbfsHeadersSnafu)?;

    println!("Rehashed {} headers.", xbfs.headers().len());

    Ok(())
}

//! Implementation store administration CLI

use anyhow::{bail, Context, Result};
use cistore_core::{
    CompositeStore, DirectoryStore, Manifest, ManifestDigest, ManifestFormat, ManifestGenerator,
    SilentTaskHandler, Store,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cistore")]
#[command(author = "Cistore Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Manage content-addressed implementation store directories")]
struct Cli {
    /// Store directory; may be given multiple times, first has read priority
    #[arg(short, long, global = true)]
    store: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a directory tree to the store, verifying it against a digest
    Add {
        /// Expected digest, e.g. sha256new_ABC...
        digest: String,
        /// Directory to copy into the store
        directory: PathBuf,
    },

    /// Calculate the manifest digest of a directory
    Digest {
        directory: PathBuf,
        /// Only use the given format (sha1, sha1new, sha256, sha256new)
        #[arg(short, long)]
        format: Option<String>,
        /// Print the full manifest instead of just the digest
        #[arg(short, long)]
        manifest: bool,
    },

    /// List all implementations in the store
    List {
        #[arg(long)]
        json: bool,
    },

    /// List leftover staging directories from interrupted additions
    ListTemp {
        #[arg(long)]
        json: bool,
    },

    /// Remove an implementation from the store
    Remove { digest: String },

    /// Check a single implementation against its digest
    Verify { digest: String },

    /// Check all implementations, reporting any that are damaged
    Audit,

    /// Deduplicate identical files across implementations
    Optimise,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = open_stores(&cli.store)?;
    let handler = SilentTaskHandler;

    match cli.command {
        Commands::Add { digest, directory } => {
            let digest = parse_digest(&digest)?;
            let path = store
                .add_directory(&directory, &digest, &handler)
                .with_context(|| format!("could not add '{}'", directory.display()))?;
            println!("{}", path.display());
        }

        Commands::Digest { directory, format, manifest } => {
            match format {
                Some(name) => {
                    let format = parse_format(&name)?;
                    let generated = ManifestGenerator::new(&directory, format)
                        .run(&handler)
                        .with_context(|| format!("could not hash '{}'", directory.display()))?;
                    if manifest {
                        print!("{generated}");
                    }
                    println!("{}", generated.calculate_digest());
                }
                None => {
                    if manifest {
                        bail!("--manifest requires --format");
                    }
                    let digest = Manifest::create_digest(&directory, &handler)
                        .with_context(|| format!("could not hash '{}'", directory.display()))?;
                    for id in digest.available_digests() {
                        println!("{id}");
                    }
                }
            }
        }

        Commands::List { json } => {
            let digests = store.list_all()?;
            let ids: Vec<String> = digests.iter().filter_map(ManifestDigest::best).collect();
            print_listing(&ids, json)?;
        }

        Commands::ListTemp { json } => {
            let paths: Vec<String> = store
                .list_all_temp()?
                .iter()
                .map(|path| path.display().to_string())
                .collect();
            print_listing(&paths, json)?;
        }

        Commands::Remove { digest } => {
            let digest = parse_digest(&digest)?;
            store.remove(&digest).with_context(|| format!("could not remove '{digest}'"))?;
            println!("Removed {digest}");
        }

        Commands::Verify { digest } => {
            let digest = parse_digest(&digest)?;
            store.verify(&digest, &handler).with_context(|| format!("'{digest}' is damaged"))?;
            println!("OK {digest}");
        }

        Commands::Audit => {
            let mut damaged = 0usize;
            for mismatch in store.audit(&handler) {
                damaged += 1;
                println!("DAMAGED {} (digest is actually {})", mismatch.expected, mismatch.actual);
            }
            if damaged > 0 {
                bail!("{damaged} damaged implementation(s) found");
            }
            println!("All implementations OK");
        }

        Commands::Optimise => {
            let saved = store.optimise(&handler).context("optimisation failed")?;
            println!("Saved {saved} bytes");
        }
    }

    Ok(())
}

/// Opens every requested store directory and composes them; falls back to
/// the user's default cache directory when none is given.
fn open_stores(paths: &[PathBuf]) -> Result<CompositeStore> {
    let paths = if paths.is_empty() { vec![default_store_dir()?] } else { paths.to_vec() };

    let mut stores: Vec<Box<dyn Store>> = Vec::new();
    for path in paths {
        let store = DirectoryStore::new(&path)
            .with_context(|| format!("could not open store at '{}'", path.display()))?;
        stores.push(Box::new(store));
    }
    Ok(CompositeStore::new(stores))
}

fn default_store_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("CISTORE_PATH") {
        return Ok(PathBuf::from(dir));
    }
    #[cfg(unix)]
    let base = std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache"));
    #[cfg(not(unix))]
    let base = std::env::var_os("LOCALAPPDATA").map(PathBuf::from);
    base.map(|dir| dir.join("cistore/implementations"))
        .context("no store given and no home directory found; use --store")
}

fn parse_digest(id: &str) -> Result<ManifestDigest> {
    ManifestDigest::from_id(id).with_context(|| format!("'{id}' is not a known digest format"))
}

fn parse_format(name: &str) -> Result<ManifestFormat> {
    // Exact names only; from_prefix would accept full digest ids too
    match name {
        "sha1" => Ok(ManifestFormat::Sha1),
        "sha1new" => Ok(ManifestFormat::Sha1New),
        "sha256" => Ok(ManifestFormat::Sha256),
        "sha256new" => Ok(ManifestFormat::Sha256New),
        other => bail!("unknown manifest format '{other}'"),
    }
}

fn print_listing(items: &[String], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
    } else {
        for item in items {
            println!("{item}");
        }
    }
    Ok(())
}

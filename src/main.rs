//! objnet — client for objnet object nodes.
//!
//! Usage:
//!   objnet --host 127.0.0.1:7070 --key sk.hex put --cid <hex> --file a.bin [--file b.bin] [--user k=v] [--verify]
//!   objnet --host ... get --cid <hex> --oid <uuid> --file out.bin
//!   objnet --host ... --key sk.hex delete --cid <hex> --oid <uuid>
//!   objnet --host ... head --cid <hex> --oid <uuid> [--full-headers]
//!   objnet --host ... search --cid <hex> [--root] [--sg] [key regex]...
//!   objnet --host ... get-range --cid <hex> --oid <uuid> offset:length...
//!   objnet --host ... get-range-hash --cid <hex> --oid <uuid> [--salt <hex>] [--verify --file f] offset:length...
//!   objnet keygen --out-dir keys/

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing_subscriber::EnvFilter;

use objnet_core::net::TcpClient;
use objnet_core::object::{
    parse_ranges, parse_salt, parse_user_header, Query, KEY_ROOT_OBJECT, KEY_STORAGE_GROUP,
};
use objnet_core::{
    Address, Client, ClientConfig, ContainerId, GetOutcome, Object, ObjectId, Verification,
};

#[derive(Parser)]
#[command(name = "objnet")]
#[command(about = "Session-bound chunked transfer against objnet object nodes", long_about = None)]
struct Cli {
    /// Node address
    #[arg(long, global = true, env = "OBJNET_HOST", default_value = "127.0.0.1:7070")]
    host: String,

    /// Ed25519 secret key: 64 hex chars or a path to a file holding them
    #[arg(long, global = true, env = "OBJNET_KEY")]
    key: Option<String>,

    /// Request time-to-live
    #[arg(long, global = true, default_value_t = objnet_core::rpc::DEFAULT_TTL)]
    ttl: u32,

    /// Deadline for the whole operation, in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store files as new objects
    Put {
        #[arg(long)]
        cid: String,
        /// File to upload; repeat for several objects
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,
        /// User header `key=value`; repeatable
        #[arg(long = "user")]
        user_headers: Vec<String>,
        /// Mark objects as root objects
        #[arg(long)]
        root: bool,
        /// Compare a full-range hash with what was sent
        #[arg(long)]
        verify: bool,
        /// Payload bytes per upload frame
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Fetch an object payload into a file
    Get {
        #[arg(long)]
        cid: String,
        #[arg(long)]
        oid: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Replace an object with a tombstone
    Delete {
        #[arg(long)]
        cid: String,
        #[arg(long)]
        oid: String,
    },
    /// Print object headers
    Head {
        #[arg(long)]
        cid: String,
        #[arg(long)]
        oid: String,
        #[arg(long)]
        full_headers: bool,
    },
    /// Find objects by header filters given as `key regex` pairs
    Search {
        #[arg(long)]
        cid: String,
        /// Only root objects
        #[arg(long)]
        root: bool,
        /// Only storage groups
        #[arg(long)]
        sg: bool,
        pairs: Vec<String>,
    },
    /// Fetch payload ranges (`offset:length`)
    GetRange {
        #[arg(long)]
        cid: String,
        #[arg(long)]
        oid: String,
        #[arg(required = true)]
        ranges: Vec<String>,
    },
    /// Request range hashes, optionally checking them against a local file
    GetRangeHash {
        #[arg(long)]
        cid: String,
        #[arg(long)]
        oid: String,
        /// Hex salt
        #[arg(long, default_value = "")]
        salt: String,
        #[arg(long, requires = "file")]
        verify: bool,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(required = true)]
        ranges: Vec<String>,
    },
    /// Generate an Ed25519 key pair
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
}

//==================== утилиты ====================//

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info,objnet_core=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Ключ — либо hex прямо в аргументе, либо путь к файлу с hex.
fn load_key(arg: Option<&str>) -> Result<SigningKey> {
    let arg = arg.context("this command needs --key")?;
    let text = if Path::new(arg).is_file() {
        fs::read_to_string(arg).with_context(|| format!("can't read key file {arg}"))?
    } else {
        arg.to_string()
    };
    let bytes = hex::decode(text.trim()).context("key is not valid hex")?;
    let secret: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key must be exactly 32 bytes"))?;
    Ok(SigningKey::from_bytes(&secret))
}

fn address(cid: &str, oid: &str) -> Result<Address> {
    let cid: ContainerId = cid.parse().context("can't parse container id")?;
    let oid: ObjectId = oid.parse().context("can't parse object id")?;
    Ok(Address::new(cid, oid))
}

fn byte_size(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

fn print_head(object: &Object) {
    let sh = &object.system_header;
    println!("System headers:");
    println!("  Object ID   : {}", sh.id);
    println!("  Owner ID    : {}", sh.owner_id);
    println!("  Container ID: {}", sh.container_id);
    println!("  Payload Size: {}", byte_size(sh.payload_length));
    println!("  Version     : {}", sh.version);
    println!(
        "  Created at  : epoch #{}, unix {}",
        sh.created_at.epoch, sh.created_at.unix_time
    );
    if !object.headers.is_empty() {
        println!("Other headers:");
        for header in &object.headers {
            println!("  {header}");
        }
    }
}

//==================== команды ====================//

async fn put_cmd(
    client: &Client<TcpClient>,
    cid: &str,
    files: &[PathBuf],
    user_headers: &[String],
    root: bool,
) -> Result<()> {
    let cid: ContainerId = cid.parse().context("can't parse container id")?;
    let mut headers: Vec<_> = user_headers.iter().map(|s| parse_user_header(s)).collect();
    if root {
        headers.push(objnet_core::Header::Root);
    }

    for path in files {
        let mut source = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("can't open {}", path.display()))?;
        println!("[{}] Sending object...", path.display());
        let outcome = client
            .put(cid, &mut source, headers.clone())
            .await
            .with_context(|| format!("can't store {}", path.display()))?;
        let address = outcome.receipt.address;
        println!("[{}] Object successfully stored", path.display());
        println!("  ID: {}\n  CID: {}", address.object_id(), address.container_id());
        match outcome.verified {
            Some(Verification::Matched) => println!("Verification result: success."),
            Some(Verification::Mismatched) => {
                println!("Verification result: hashes are not equal.")
            }
            Some(Verification::Unavailable(reason)) => println!(
                "Verification result: can't perform GETRANGEHASH request ({reason})."
            ),
            None => {}
        }
    }
    Ok(())
}

async fn get_cmd(client: &Client<TcpClient>, address: Address, file: &Path) -> Result<()> {
    println!("Waiting for data...");
    // файл открываем только когда пришёл заголовок живого объекта
    let outcome = client.get_into(address, |_| tokio::fs::File::create(file)).await;
    match outcome {
        Ok(GetOutcome::Removed(_)) => println!("Object removed"),
        Ok(GetOutcome::Received(report)) => {
            println!("Object origin received: {}", report.object.system_header.id);
            println!(
                "Object successfully fetched: {} in {} chunk(s)",
                byte_size(report.bytes),
                report.chunks
            );
        }
        Err(objnet_core::ObjnetError::Corrupted(reason)) => {
            println!("Object corrupted");
            bail!("tombstone verification failed: {reason}");
        }
        Err(err) => {
            let dest = file.display();
            return Err(err).with_context(|| format!("can't fetch object into {dest}"));
        }
    }
    Ok(())
}

async fn get_range_hash_cmd(
    client: &Client<TcpClient>,
    address: Address,
    salt: &str,
    file: Option<&Path>,
    ranges: &[String],
) -> Result<()> {
    let ranges = parse_ranges(ranges).context("can't parse ranges")?;
    let salt = parse_salt(salt).context("can't parse salt")?;
    let mut local = match file {
        Some(path) => Some(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("could not open {}", path.display()))?,
        ),
        None => None,
    };
    let checks = client
        .get_range_hash(address, &ranges, &salt, local.as_mut())
        .await
        .context("can't perform GETRANGEHASH request")?;
    for check in checks {
        match check.matches_local {
            Some(true) => print!("(valid) "),
            Some(false) => print!("(invalid) "),
            None => {}
        }
        println!("{}", check.digest);
    }
    Ok(())
}

fn keygen_cmd(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("mkdir {}", out_dir.display()))?;
    let sk = SigningKey::generate(&mut OsRng);
    let owner = objnet_core::OwnerId::from_public_key(&sk.verifying_key());
    fs::write(out_dir.join("sk.hex"), hex::encode(sk.to_bytes()))?;
    fs::write(out_dir.join("pk.hex"), hex::encode(sk.verifying_key().as_bytes()))?;
    println!("keypair written → {}", out_dir.display());
    println!("owner id: {owner}");
    Ok(())
}

//==================== main ====================//

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Keygen { out_dir } = &cli.command {
        return keygen_cmd(out_dir);
    }

    let mut config = ClientConfig {
        ttl: cli.ttl,
        timeout: cli.timeout_ms.map(Duration::from_millis),
        ..ClientConfig::default()
    };
    if let Commands::Put {
        verify, chunk_size, ..
    } = &cli.command
    {
        config.verify_after_put = *verify;
        if let Some(size) = chunk_size {
            config.chunk_size = *size;
        }
    }

    // для чтения (get/head/...) ключ не обязателен — подойдёт одноразовый
    let key = match cli.key.as_deref() {
        Some(arg) => load_key(Some(arg))?,
        None if matches!(cli.command, Commands::Put { .. } | Commands::Delete { .. }) => {
            load_key(None)?
        }
        None => SigningKey::generate(&mut OsRng),
    };
    let client = Client::new(TcpClient::new(cli.host.clone()), key, config)
        .context("invalid client configuration")?;

    match &cli.command {
        Commands::Put {
            cid,
            files,
            user_headers,
            root,
            ..
        } => put_cmd(&client, cid, files, user_headers, *root).await,
        Commands::Get { cid, oid, file } => get_cmd(&client, address(cid, oid)?, file).await,
        Commands::Delete { cid, oid } => {
            client
                .delete(address(cid, oid)?)
                .await
                .context("can't perform DELETE request")?;
            println!("Object removed");
            Ok(())
        }
        Commands::Head {
            cid,
            oid,
            full_headers,
        } => {
            let object = client
                .head(address(cid, oid)?, *full_headers)
                .await
                .context("can't perform HEAD request")?;
            print_head(&object);
            Ok(())
        }
        Commands::Search { cid, root, sg, pairs } => {
            let cid: ContainerId = cid.parse().context("can't parse container id")?;
            let mut query = Query::from_pairs(pairs).context("can't parse query")?;
            if *root {
                query = query.with_exact(KEY_ROOT_OBJECT);
            }
            if *sg {
                query = query.with_exact(KEY_STORAGE_GROUP);
            }
            let found = client
                .search(cid, query)
                .await
                .context("can't perform SEARCH request")?;
            println!("Container ID: Object ID");
            for address in found {
                println!("{}: {}", address.container_id(), address.object_id());
            }
            Ok(())
        }
        Commands::GetRange { cid, oid, ranges } => {
            let ranges = parse_ranges(ranges).context("can't parse ranges")?;
            let fragments = client
                .get_range(address(cid, oid)?, &ranges)
                .await
                .context("can't perform GETRANGE request")?;
            for (range, fragment) in ranges.iter().zip(fragments) {
                println!("{range}: {}", hex::encode(fragment));
            }
            Ok(())
        }
        Commands::GetRangeHash {
            cid,
            oid,
            salt,
            verify,
            file,
            ranges,
        } => {
            let local = if *verify { file.as_deref() } else { None };
            get_range_hash_cmd(&client, address(cid, oid)?, salt, local, ranges).await
        }
        Commands::Keygen { .. } => Ok(()),
    }
}

//! Murmur command-line tool.
//!
//! # Usage
//!
//! ```bash
//! # Create the identity and export a bundle for the directory
//! murmur --store alice.redb init
//! murmur --store alice.redb bundle --min-one-time 50
//!
//! # Compare safety numbers out of band
//! murmur --store alice.redb safety-number --local-id alice --peer-id bob --peer-key <hex>
//!
//! # Mapping vault
//! murmur --store alice.redb vault seal --owner alice --payload 1234
//! murmur --store alice.redb vault rotate --owner alice
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use murmur_cli::{LocalStore, parse_identity};
use murmur_core::{CoreConfig, EncryptedRecord, RedbStorage, storage};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Murmur local secure store
#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(about = "Manage a local Murmur identity, prekeys and mapping vault")]
#[command(version)]
struct Args {
    /// Path to the redb store
    #[arg(short, long, env = "MURMUR_STORE", default_value = "murmur.redb")]
    store: PathBuf,

    /// One-time prekeys generated per top-up
    #[arg(
        long,
        env = "MURMUR_PREKEY_BATCH",
        default_value_t = CoreConfig::default().one_time_prekey_batch
    )]
    prekey_batch: u32,

    /// Signed prekey lifetime in seconds
    #[arg(
        long,
        env = "MURMUR_SIGNED_PREKEY_ROTATION_SECS",
        default_value_t = CoreConfig::default().signed_prekey_rotation_secs
    )]
    signed_prekey_rotation_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the identity (no-op if it exists) and print it
    Init,

    /// Print the public identity as hex
    Identity,

    /// Top up prekeys and print the bundle as hex CBOR
    Bundle {
        /// Minimum one-time prekeys in the pool afterwards
        #[arg(long)]
        min_one_time: Option<u32>,
    },

    /// Print the safety number for a peer, pinning its key on first use
    SafetyNumber {
        /// Our user id
        #[arg(long)]
        local_id: String,
        /// Peer user id
        #[arg(long)]
        peer_id: String,
        /// Peer identity key (hex)
        #[arg(long)]
        peer_key: String,
    },

    /// Accept a peer identity key after verifying it
    Trust {
        /// Peer user id
        #[arg(long)]
        peer_id: String,
        /// Peer identity key (hex)
        #[arg(long)]
        peer_key: String,
    },

    /// Forget the pinned key of a peer
    Forget {
        /// Peer user id
        #[arg(long)]
        peer_id: String,
    },

    /// Mapping vault records
    #[command(subcommand)]
    Vault(VaultCommand),
}

#[derive(Subcommand, Debug)]
enum VaultCommand {
    /// Encrypt a payload as the owner's record
    Seal {
        /// Record owner
        #[arg(long)]
        owner: String,
        /// Payload (UTF-8)
        #[arg(long)]
        payload: String,
    },

    /// Decrypt the owner's record
    Open {
        /// Record owner
        #[arg(long)]
        owner: String,
    },

    /// Re-encrypt the owner's record under a new key
    Rotate {
        /// Record owner
        #[arg(long)]
        owner: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();


    let config = CoreConfig {
        one_time_prekey_batch: args.prekey_batch,
        signed_prekey_rotation_secs: args.signed_prekey_rotation_secs,
        ..CoreConfig::default()
    };
    tracing::debug!(store = %args.store.display(), "opening store");
    let store = LocalStore::open(&args.store, config.clone())?;

    for line in run(&store, &config, args.command)? {
        emit(&line);
    }
    Ok(())
}

fn run(
    store: &LocalStore<RedbStorage>,
    config: &CoreConfig,
    command: Command,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    Ok(match command {
        Command::Init => vec![hex::encode(store.init()?.to_bytes())],
        Command::Identity => vec![hex::encode(store.identity()?.to_bytes())],
        Command::Bundle { min_one_time } => {
            let bundle = store.bundle(min_one_time.unwrap_or(config.one_time_prekey_batch))?;
            vec![
                format!("registration id: {}", bundle.registration_id),
                format!("signed prekey id: {}", bundle.signed_pre_key_id),
                format!("one-time prekeys: {}", store.one_time_pre_key_count()),
                hex::encode(storage::encode(&bundle)?),
            ]
        },
        Command::SafetyNumber { local_id, peer_id, peer_key } => {
            let number = store.safety_number(&local_id, &peer_id, &parse_identity(&peer_key)?)?;
            vec![number.to_string()]
        },
        Command::Trust { peer_id, peer_key } => {
            store.trust(&peer_id, &parse_identity(&peer_key)?)?;
            vec![format!("trusted {peer_id}")]
        },
        Command::Forget { peer_id } => {
            store.forget(&peer_id)?;
            vec![format!("forgot {peer_id}")]
        },
        Command::Vault(VaultCommand::Seal { owner, payload }) => {
            describe(&store.seal(&owner, payload.as_bytes())?)
        },
        Command::Vault(VaultCommand::Open { owner }) => {
            vec![String::from_utf8_lossy(&store.open_record(&owner)?).into_owned()]
        },
        Command::Vault(VaultCommand::Rotate { owner }) => describe(&store.rotate(&owner)?),
    })
}

fn describe(record: &EncryptedRecord) -> Vec<String> {
    vec![
        format!("key id: {}", record.key_id),
        format!("algorithm: {:?}", record.algorithm),
        format!("version: {:?}", record.version),
        format!("created at: {}", record.created_at),
    ]
}

#[allow(clippy::print_stdout)]
fn emit(line: &str) {
    println!("{line}");
}

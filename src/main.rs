use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
mod auth;
use masterkdf::crypto::{
    AES_KDF_DEFAULT_ROUNDS, ARGON2_DEFAULT_ITERATIONS, ARGON2_DEFAULT_MEMORY_KIB,
    ARGON2_DEFAULT_PARALLELISM, Argon2Variant, Argon2Version,
};
use masterkdf::{
    DerivationEngine, EngineConfig, ErrorKind, KdfAlgorithm, KdfError, MasterKey, RawKdfParams,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AlgorithmArg {
    Argon2d,
    Argon2id,
    AesKdf,
}

impl AlgorithmArg {
    fn raw(self) -> RawKdfParams {
        match self {
            AlgorithmArg::Argon2d => RawKdfParams::new(KdfAlgorithm::MemoryHard)
                .with_variant(Argon2Variant::Argon2d as u32),
            AlgorithmArg::Argon2id => RawKdfParams::new(KdfAlgorithm::MemoryHard)
                .with_variant(Argon2Variant::Argon2id as u32),
            AlgorithmArg::AesKdf => RawKdfParams::new(KdfAlgorithm::LegacyIterative),
        }
    }

    fn algorithm(self) -> KdfAlgorithm {
        match self {
            AlgorithmArg::Argon2d | AlgorithmArg::Argon2id => KdfAlgorithm::MemoryHard,
            AlgorithmArg::AesKdf => KdfAlgorithm::LegacyIterative,
        }
    }
}

#[derive(Debug, clap::Args)]
struct Argon2Args {
    /// Argon2 memory cost in KiB (default: 65536)
    #[arg(long = "argon-mem")]
    mem_cost_kib: Option<u64>,

    /// Argon2 time cost / passes (default: 3)
    #[arg(long = "argon-time")]
    time_cost: Option<u64>,

    /// Argon2 parallelism (default: 2)
    #[arg(long = "argon-parallelism")]
    parallelism: Option<u32>,

    /// Argon2 version, decimal or 0x-prefixed (default: 0x13)
    #[arg(long = "argon-version", value_parser = parse_u32)]
    version: Option<u32>,

    /// Argon2 secret key, hex encoded
    #[arg(long = "argon-secret")]
    secret_key: Option<String>,

    /// Argon2 associated data, hex encoded
    #[arg(long = "argon-ad")]
    associated_data: Option<String>,
}

#[derive(Debug, clap::Args)]
struct KdfArgs {
    /// Key derivation function
    #[arg(long, value_enum, default_value_t = AlgorithmArg::Argon2id)]
    algorithm: AlgorithmArg,

    /// Salt, hex encoded
    #[arg(long)]
    salt: String,

    /// AES-KDF transformation rounds (default: 60000)
    #[arg(long = "aes-rounds")]
    rounds: Option<u64>,

    #[command(flatten)]
    argon2: Argon2Args,
}

impl KdfArgs {
    fn to_raw_params(&self) -> Result<RawKdfParams> {
        let mut raw = self
            .algorithm
            .raw()
            .with_salt(decode_hex("salt", &self.salt)?);

        if self.algorithm == AlgorithmArg::AesKdf {
            return Ok(raw.with_iterations(self.rounds.unwrap_or(AES_KDF_DEFAULT_ROUNDS)));
        }

        let args = &self.argon2;
        raw = raw
            .with_version(args.version.unwrap_or(Argon2Version::V0x13 as u32))
            .with_iterations(args.time_cost.unwrap_or(ARGON2_DEFAULT_ITERATIONS))
            .with_memory_kib(args.mem_cost_kib.unwrap_or(ARGON2_DEFAULT_MEMORY_KIB))
            .with_parallelism(args.parallelism.unwrap_or(ARGON2_DEFAULT_PARALLELISM));
        if let Some(secret) = &args.secret_key {
            raw = raw.with_secret_key(decode_hex("argon-secret", secret)?);
        }
        if let Some(ad) = &args.associated_data {
            raw = raw.with_associated_data(decode_hex("argon-ad", ad)?);
        }
        Ok(raw)
    }
}

fn decode_hex(flag: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value).with_context(|| format!("--{flag} is not valid hex"))
}

fn parse_u32(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex_digits) => u32::from_str_radix(hex_digits, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{value}': {e}"))
}

#[derive(Debug, Parser)]
#[command(name = "masterkdf")]
#[command(
    version,
    about = "Derives database master keys with Argon2 or AES-KDF."
)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true, value_name = "PATH", env = "MASTERKDF_CONFIG")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Derives the master key from a password and KDF parameters
    Derive {
        #[command(flatten)]
        kdf: KdfArgs,

        /// Keyfile folded into the master key
        #[arg(long, value_name = "PATH")]
        keyfile: Option<PathBuf>,

        /// Print a JSON report instead of the bare key
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Prints default parameters with a fresh random salt
    Params {
        #[arg(long, value_enum, default_value_t = AlgorithmArg::Argon2id)]
        algorithm: AlgorithmArg,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("interrupted, key derivation abandoned")]
struct Interrupted;

#[derive(Serialize)]
struct DeriveReport<'a> {
    algorithm: String,
    master_key: &'a str,
    keyfile: bool,
    elapsed_ms: u64,
}

#[derive(Serialize)]
struct ParamsReport {
    algorithm: AlgorithmArg,
    salt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    iterations: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_kib: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallelism: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

impl Serialize for AlgorithmArg {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let name = match self {
            AlgorithmArg::Argon2d => "argon2d",
            AlgorithmArg::Argon2id => "argon2id",
            AlgorithmArg::AesKdf => "aes-kdf",
        };
        serializer.serialize_str(name)
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(run(cli));
    // An abandoned derivation may still be running on a worker thread.
    runtime.shutdown_background();

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let engine = DerivationEngine::new(config);
    engine.init().context("key derivation self-test failed")?;

    match cli.command {
        Commands::Derive { kdf, keyfile, json } => {
            let raw = kdf.to_raw_params()?;
            let keyfile_data = keyfile.as_deref().map(auth::read_keyfile).transpose()?;
            let has_keyfile = keyfile_data.is_some();
            let password = auth::read_password()?;

            let started = Instant::now();
            let key = derive_interruptible(&engine, password, &raw, keyfile_data).await?;
            let hex_key = key.to_hex();

            if json {
                let report = DeriveReport {
                    algorithm: raw.algorithm.to_string(),
                    master_key: hex_key.as_str(),
                    keyfile: has_keyfile,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", hex_key.as_str());
            }
        }

        Commands::Params { algorithm } => {
            let mut raw = RawKdfParams::generate(algorithm.algorithm())?;
            if let Some(variant) = algorithm.raw().variant {
                raw = raw.with_variant(variant);
            }
            let report = ParamsReport {
                algorithm,
                salt: hex::encode(raw.salt.as_deref().unwrap_or_default()),
                iterations: raw.iterations,
                memory_kib: raw.memory_kib,
                parallelism: raw.parallelism,
                version: raw.version.map(|v| format!("{v:#x}")),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn derive_interruptible(
    engine: &DerivationEngine,
    password: Zeroizing<Vec<u8>>,
    raw: &RawKdfParams,
    keyfile: Option<Zeroizing<Vec<u8>>>,
) -> Result<MasterKey> {
    let interrupted = Arc::new(Notify::new());
    let notify = Arc::clone(&interrupted);
    ctrlc::set_handler(move || notify.notify_one()).context("failed to install Ctrl-C handler")?;

    tokio::select! {
        key = engine.unlock_async(password, raw, keyfile) => Ok(key?),
        _ = interrupted.notified() => Err(Interrupted.into()),
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<Interrupted>().is_some() {
        return 130;
    }
    match err.downcast_ref::<KdfError>().map(KdfError::kind) {
        Some(ErrorKind::Validation) => 2,
        Some(ErrorKind::UnsupportedVersion) => 3,
        Some(ErrorKind::Allocation) => 4,
        _ => 1,
    }
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

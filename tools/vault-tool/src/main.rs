//! chrysalis-vault: host-side companion for the Chrysalis trust gate.
//!
//! ```text
//!  keygen ──> vault.key (secret, hex) + public key on stdout
//!  sign   ──> <volume>/EFI/CHRYSALIS/vault.json + vault.sig
//!  embed  ──> public key written between the markers of Chrysalis.efi
//!  verify ──> runs Early Init against the volume exactly as the loader would
//! ```
//!
//! ## Usage
//!
//! ```bash
//! chrysalis-vault keygen --out vault.key
//! chrysalis-vault sign --volume /Volumes/EFI --key vault.key
//! chrysalis-vault embed --image Chrysalis.efi --public-key <hex>
//! chrysalis-vault verify --volume /Volumes/EFI --public-key <hex>
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrysalis::errors::FirmwareError;
use chrysalis::misc::early_init;
use chrysalis::paths::{IMAGE_PATH, LOG_PREFIX_PATH, ROOT_PATH, VAULT_PATH, VAULT_SIGNATURE_PATH};
use chrysalis::vault::{embed_key, VaultManifest};
use chrysalis::{AssetSource, VaultKey};
use clap::{Parser, Subcommand};
use ed25519_dalek::{Signer, SigningKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use rand_core::OsRng;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chrysalis-vault")]
#[command(about = "Sign and verify the Chrysalis asset vault")]
struct Args {
    /// Log filter, e.g. `debug` or `chrysalis=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a signing key pair
    Keygen {
        /// Where to write the hex secret key
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Hash every asset into vault.json and sign it
    Sign {
        /// Volume root containing EFI/CHRYSALIS
        #[arg(short, long)]
        volume: PathBuf,
        /// Hex secret key file from `keygen`
        #[arg(short, long)]
        key: PathBuf,
    },
    /// Write a public key into a loader image
    Embed {
        /// Loader image to patch in place
        #[arg(short, long)]
        image: PathBuf,
        /// Hex public key
        #[arg(short, long)]
        public_key: String,
    },
    /// Run Early Init against a volume
    Verify {
        /// Volume root containing EFI/CHRYSALIS
        #[arg(short, long)]
        volume: PathBuf,
        /// Hex public key; omit to check an unsigned volume
        #[arg(short, long)]
        public_key: Option<String>,
    },
}

fn init_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Volume directory seen through the loader's path convention.
struct DirSource {
    root: PathBuf,
}

impl DirSource {
    fn resolve(&self, path: &str) -> PathBuf {
        path.split('\\')
            .filter(|c| !c.is_empty())
            .fold(self.root.clone(), |acc, c| acc.join(c))
    }
}

impl AssetSource for DirSource {
    fn read(&self, path: &str) -> Result<Vec<u8>, FirmwareError> {
        let resolved = self.resolve(path);
        fs::read(&resolved).map_err(|e| {
            debug!(path = %resolved.display(), error = %e, "read failed");
            match e.kind() {
                ErrorKind::NotFound => FirmwareError::NotFound,
                ErrorKind::PermissionDenied => FirmwareError::AccessDenied,
                _ => FirmwareError::DeviceError,
            }
        })
    }
}

fn asset_root(volume: &Path) -> PathBuf {
    ROOT_PATH.split('\\').fold(volume.to_path_buf(), |acc, c| acc.join(c))
}

/// Every signable file under `root`, as `\`-separated relative paths.
///
/// Skips the vault files, the loader image and log files, all of which
/// change after signing.
fn collect_assets(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut assets = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("{} escapes the asset root", path.display()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("\\");
            if !is_signable(&relative) {
                debug!(path = %relative, "not signed");
                continue;
            }
            assets.push((relative, path));
        }
    }
    assets.sort();
    Ok(assets)
}

fn is_signable(relative: &str) -> bool {
    let lower = relative.to_ascii_lowercase();
    let image = IMAGE_PATH.rsplit('\\').next().unwrap_or(IMAGE_PATH).to_ascii_lowercase();
    lower != VAULT_PATH
        && lower != VAULT_SIGNATURE_PATH
        && lower != image
        && !lower.starts_with(&format!("{LOG_PREFIX_PATH}-"))
}

fn parse_public_key(text: &str) -> Result<VaultKey> {
    let bytes: [u8; PUBLIC_KEY_LENGTH] = hex::decode(text.trim())
        .context("public key is not hex")?
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("public key must be {PUBLIC_KEY_LENGTH} bytes, got {}", b.len()))?;
    Ok(VaultKey::from_bytes(&bytes)?)
}

fn read_signing_key(path: &Path) -> Result<SigningKey> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let bytes: [u8; SECRET_KEY_LENGTH] = hex::decode(text.trim())
        .context("secret key is not hex")?
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("secret key must be {SECRET_KEY_LENGTH} bytes, got {}", b.len()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn keygen(out: &Path) -> Result<()> {
    if out.exists() {
        bail!("{} already exists, refusing to overwrite", out.display());
    }
    let key = SigningKey::generate(&mut OsRng);
    fs::write(out, hex::encode(key.to_bytes())).with_context(|| format!("writing {}", out.display()))?;
    info!(path = %out.display(), "secret key written");
    println!("{}", hex::encode(key.verifying_key().to_bytes()));
    Ok(())
}

fn sign(volume: &Path, key: &Path) -> Result<()> {
    let signer = read_signing_key(key)?;
    let root = asset_root(volume);
    let mut manifest = VaultManifest::new();
    for (relative, path) in collect_assets(&root)? {
        let data = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        debug!(path = %relative, bytes = data.len(), "hashing");
        manifest.insert(&relative, &data);
    }
    if manifest.is_empty() {
        bail!("no assets under {}", root.display());
    }

    let json = manifest.to_json();
    let signature = signer.sign(&json);
    fs::write(root.join(VAULT_PATH), &json).context("writing vault manifest")?;
    fs::write(root.join(VAULT_SIGNATURE_PATH), signature.to_bytes()).context("writing vault signature")?;
    info!(files = manifest.len(), "vault signed");
    Ok(())
}

fn embed(image: &Path, public_key: &str) -> Result<()> {
    let key = parse_public_key(public_key)?;
    let mut bytes = fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    embed_key(&mut bytes, &key.to_bytes())?;
    fs::write(image, &bytes).with_context(|| format!("writing {}", image.display()))?;
    info!(image = %image.display(), key = ?key, "vault key embedded");
    Ok(())
}

fn verify(volume: &Path, public_key: Option<&str>) -> Result<()> {
    let key = public_key.map(parse_public_key).transpose()?;
    let source = DirSource {
        root: volume.to_path_buf(),
    };
    let early = early_init(&source, key.as_ref())?;
    info!(
        vaulted = early.storage.is_vaulted(),
        policy = ?early.config.misc.security.vault,
        "volume passes early init"
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    match args.command {
        Command::Keygen { out } => keygen(&out),
        Command::Sign { volume, key } => sign(&volume, &key),
        Command::Embed { image, public_key } => embed(&image, &public_key),
        Command::Verify { volume, public_key } => verify(&volume, public_key.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("chrysalis-vault-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(asset_root(&dir).join("ACPI")).unwrap();
        dir
    }

    #[test]
    fn signed_volume_passes_early_init() {
        let volume = scratch("sign");
        let root = asset_root(&volume);
        fs::write(root.join("config.json"), br#"{"Misc": {"Security": {"Vault": "Secure"}}}"#).unwrap();
        fs::write(root.join("ACPI").join("SSDT-EC.aml"), b"SSDT").unwrap();
        fs::write(root.join("chrysalis-2026-10-18-120000.txt"), b"old log").unwrap();
        fs::write(root.join("Chrysalis.efi"), b"MZloader").unwrap();

        let key_path = volume.join("vault.key");
        let signer = SigningKey::from_bytes(&[9; SECRET_KEY_LENGTH]);
        fs::write(&key_path, hex::encode(signer.to_bytes())).unwrap();
        sign(&volume, &key_path).unwrap();

        let listed: Vec<String> = collect_assets(&root).unwrap().into_iter().map(|(p, _)| p).collect();
        assert_eq!(listed, ["ACPI\\SSDT-EC.aml", "config.json"]);

        let public = hex::encode(signer.verifying_key().to_bytes());
        verify(&volume, Some(&public)).unwrap();

        fs::write(root.join("ACPI").join("SSDT-EC.aml"), b"SSDX").unwrap();
        assert!(verify(&volume, Some(&public)).is_err());
        fs::remove_dir_all(&volume).unwrap();
    }

    #[test]
    fn embed_fills_the_marker_region() {
        let dir = scratch("embed");
        let image = dir.join("Chrysalis.efi");
        let mut bytes = b"MZ....=BEGIN CHRYSALIS VAULT=".to_vec();
        bytes.extend_from_slice(&[0; PUBLIC_KEY_LENGTH]);
        bytes.extend_from_slice(b"=END CHRYSALIS VAULT=....");
        fs::write(&image, &bytes).unwrap();

        let signer = SigningKey::from_bytes(&[3; SECRET_KEY_LENGTH]);
        let public = signer.verifying_key().to_bytes();
        embed(&image, &hex::encode(public)).unwrap();

        let patched = fs::read(&image).unwrap();
        let region = chrysalis::vault::embedded_region(&patched).unwrap();
        assert_eq!(&patched[region], &public);
        fs::remove_dir_all(&dir).unwrap();
    }
}

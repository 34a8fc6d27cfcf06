#![forbid(unsafe_code)]

//! Deployment tool that writes the bootstrap credential blob.
//!
//! Either wraps an existing credential JSON file or mints a fresh ed25519
//! identity, encodes the obfuscated blob, and records its path in the target
//! `.env` file so the relay binaries can find it. The printed public key is
//! what the secret service needs to admit the new identity.

use anyhow::{Context, Result, anyhow, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use skyward_tools::config::upsert_env_value;
use skyward_tools::credentials::{ServiceCredential, encode_blob};
use skyward_tools::secrets::SigningIdentity;
use skyward_tools::security::ensure_not_root;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone)]
struct SealArgs {
    out: PathBuf,
    credential: Option<PathBuf>,
    mint_account: Option<String>,
    env_file: Option<PathBuf>,
}

impl SealArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut out: Option<PathBuf> = None;
        let mut credential: Option<PathBuf> = None;
        let mut mint_account: Option<String> = None;
        let mut env_file: Option<PathBuf> = None;
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--out" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--out requires a value"))?;
                    out = Some(PathBuf::from(value));
                }
                "--credential" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--credential requires a value"))?;
                    credential = Some(PathBuf::from(value));
                }
                "--mint" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--mint requires an account id"))?;
                    mint_account = Some(value);
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    env_file = Some(PathBuf::from(value));
                }
                _ => bail!("unknown argument: {arg}"),
            }
        }

        let out = out.ok_or_else(|| anyhow!("--out is required"))?;
        if credential.is_some() && mint_account.is_some() {
            bail!("--credential and --mint are mutually exclusive");
        }
        if credential.is_none() && mint_account.is_none() {
            bail!("either --credential or --mint must be given");
        }

        Ok(Self {
            out,
            credential,
            mint_account,
            env_file,
        })
    }
}

fn main() -> Result<()> {
    ensure_not_root("seal_credentials")?;

    let args = SealArgs::parse()?;
    let credential = load_or_mint_credential(&args)?;
    let identity = SigningIdentity::from_credential(&credential)
        .context("validating credential key material")?;

    write_blob(&args.out, &credential)?;
    println!("Wrote bootstrap blob to {}", args.out.display());

    if let Some(env_file) = &args.env_file {
        upsert_env_value(env_file, "SKYWARD_BLOB", &args.out.to_string_lossy())
            .with_context(|| format!("updating {}", env_file.display()))?;
        println!("Recorded SKYWARD_BLOB in {}", env_file.display());
    }

    println!("Account: {}", identity.account_id());
    println!("Public key: {}", identity.public_key_base64());
    println!("Fingerprint: {}", credential.fingerprint());
    println!("Register the public key with the secret service before first start.");

    Ok(())
}

fn load_or_mint_credential(args: &SealArgs) -> Result<ServiceCredential> {
    if let Some(path) = &args.credential {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading credential file {}", path.display()))?;
        return ServiceCredential::from_json(&text)
            .with_context(|| format!("parsing credential file {}", path.display()));
    }

    let account_id = args
        .mint_account
        .clone()
        .expect("argument parsing enforces --mint");
    let key = SigningKey::generate(&mut OsRng);
    Ok(ServiceCredential {
        account_id,
        private_key: BASE64.encode(key.to_bytes()),
    })
}

/// Serializes and obfuscates the credential, writing the blob atomically so a
/// crashed deploy never leaves a half-written file behind.
fn write_blob(out: &Path, credential: &ServiceCredential) -> Result<()> {
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let json = serde_json::to_string(credential).context("serializing credential")?;
    let blob = encode_blob(&json).context("encoding bootstrap blob")?;

    let tmp_path = out.with_extension("tmp");
    fs::write(&tmp_path, &blob).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, out).with_context(|| format!("renaming into {}", out.display()))?;
    Ok(())
}

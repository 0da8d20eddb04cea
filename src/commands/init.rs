//! `flcsd init`: scaffolds a fresh `database/` tree, generates the server's
//! certificate authority (C4), and writes a default JSON config (SPEC_FULL
//! §10.1).

use std::path::Path;

use anyhow::{bail, Result};
use rand::Rng;
use tracing::info;

use crate::ca::{self, CertificateAuthority};
use crate::config::Config;

/// Runs the init command. Refuses to overwrite an existing config unless
/// `force` is set, matching the teacher's existing-config guard.
pub fn run(config_path: &Path, force: bool) -> Result<()> {
    if Config::exists(config_path) && !force {
        bail!(
            "Config already exists at {}\nUse --force to overwrite, or pass a different --config path.",
            config_path.display()
        );
    }

    let mut config = Config::default();
    config.registration_token = generate_registration_token();

    std::fs::create_dir_all(&config.database)?;
    std::fs::create_dir_all(&config.saved_models)?;
    std::fs::create_dir_all(config.database.join("logs"))?;
    std::fs::create_dir_all(config.database.join("adrm_models"))?;
    std::fs::create_dir_all(config.database.join("adrm_quarantine"))?;

    let ca_dir = ca::default_ca_dir(&config.database);
    CertificateAuthority::generate(&ca_dir)?;
    info!(dir = %ca_dir.display(), "generated certificate authority");

    config.save(config_path)?;
    info!(path = %config_path.display(), "wrote server configuration");

    println!("FLCS server initialized.");
    println!("Config saved to: {}", config_path.display());
    println!("Certificate authority generated at: {}", ca_dir.display());
    println!("\nRegistration token (share with clients enrolling against this server):");
    println!("  {}", config.registration_token);
    println!("\nNext step:");
    println!("  flcsd run --config {}", config_path.display());

    Ok(())
}

fn generate_registration_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

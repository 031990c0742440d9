//! `wmux token`: mint a shared-secret auth token.
//!
//! Prints a fresh random token for provisioning: set it as `WMUX_AUTH_TOKEN`
//! (or in the config files) on both the worker and the client side.

use anyhow::Result;
use wmux_core::generate_token;

pub async fn run() -> Result<()> {
    println!("{}", generate_token());
    Ok(())
}

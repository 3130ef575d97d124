//! Login-item registration
//!
//! Keeps the OS launch entry in sync with the `autostart` setting:
//! enables it when requested, and removes a stale entry when the
//! setting is turned off. Failures are reported but never stop the
//! agent; running without autostart is always acceptable.

use auto_launch::AutoLaunchBuilder;
use thiserror::Error;
use tracing::info;

use relay_core::config::AgentConfig;

const APP_NAME: &str = "relay-agent";

#[derive(Debug, Error)]
pub enum AutostartError {
    #[error("could not determine executable path: {0}")]
    ExePath(#[from] std::io::Error),

    #[error("login-item registration failed: {0}")]
    Registration(#[from] auto_launch::Error),
}

/// Bring the login item in line with the configuration.
pub fn sync(config: &AgentConfig) -> Result<(), AutostartError> {
    let exe = std::env::current_exe()?;
    let entry = AutoLaunchBuilder::new()
        .set_app_name(APP_NAME)
        .set_app_path(&exe.to_string_lossy())
        .set_args(&config.autostart_args)
        .build()?;

    if config.autostart {
        if !entry.is_enabled()? {
            entry.enable()?;
            info!("Registered login item {:?}", exe);
        }
    } else if entry.is_enabled()? {
        entry.disable()?;
        info!("Removed login item {:?}", exe);
    }

    Ok(())
}

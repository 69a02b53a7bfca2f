/// Waveform registration config.
///
/// The `.cfg` file has three markers, matched case-insensitively at line
/// start after trimming spaces and CR/LF:
///
/// ```text
/// [header]
/// minimum-smartsdr-version: 2.0.0.0
/// [setup]
/// waveform create name=FreeDV-USB mode=FDVU underlying_mode=USB
/// waveform set FreeDV-USB tx=1
/// [end]
/// ```
///
/// Everything between `[setup]` and `[end]` is relayed verbatim to the
/// radio as commands. A missing marker is fatal to registration.
use crate::transport_api::ApiHandle;
use anyhow::bail;
use std::time::Duration;
use tracing::info;

/// Per-command reply deadline during registration replay.
const SETUP_CMD_TIMEOUT: Duration = Duration::from_secs(1);

/// Parsed registration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformCfg {
    /// Captured from the header section; not enforced.
    pub minimum_smartsdr_version: String,
    /// Setup commands in file order.
    pub setup_cmds: Vec<String>,
}

/// Parse a registration file's text into its version string and setup
/// command list.
pub fn parse_waveform_cfg(contents: &str) -> anyhow::Result<WaveformCfg> {
    let mut lines = contents
        .lines()
        .map(|l| l.trim_matches(|c| c == ' ' || c == '\r'));

    if !lines.any(|l| l.to_lowercase().starts_with("[header]")) {
        bail!("hit end of file without finding [header]");
    }

    let mut minimum_smartsdr_version = None;
    for line in lines.by_ref() {
        let lower = line.to_lowercase();
        if lower.starts_with("minimum-smartsdr-version:") {
            if let Some(vers) = line.split(' ').nth(1) {
                minimum_smartsdr_version = Some(vers.to_string());
                break;
            }
        }
        if lower.starts_with("[setup]") {
            bail!("hit [setup] without finding minimum-smartsdr-version");
        }
    }
    let Some(minimum_smartsdr_version) = minimum_smartsdr_version else {
        bail!("hit end of file without finding minimum-smartsdr-version");
    };

    if !lines.any(|l| l.to_lowercase().starts_with("[setup]")) {
        bail!("hit end of file without finding [setup]");
    }

    let mut setup_cmds = Vec::new();
    let mut saw_end = false;
    for line in lines {
        if line.to_lowercase().starts_with("[end]") {
            saw_end = true;
            break;
        }
        if !line.is_empty() {
            setup_cmds.push(line.to_string());
        }
    }
    if !saw_end {
        bail!("hit end of file without finding [end]");
    }

    Ok(WaveformCfg {
        minimum_smartsdr_version,
        setup_cmds,
    })
}

/// Replay a parsed registration against the radio, one command at a time.
pub async fn register_waveform(api: &ApiHandle, cfg: &WaveformCfg) -> anyhow::Result<()> {
    info!(
        min_version = %cfg.minimum_smartsdr_version,
        commands = cfg.setup_cmds.len(),
        "registering waveform"
    );
    for cmd in &cfg.setup_cmds {
        match api.do_command(cmd, SETUP_CMD_TIMEOUT).await {
            Ok((resp, status)) => info!("{:x}/{}:{}", status, resp, cmd),
            Err(e) => info!(error = %e, "no reply to setup command: {}", cmd),
        }
    }
    Ok(())
}

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use std::env;
use std::path::PathBuf;
use std::process::Command;

/// One pipeline stage: a sibling binary plus the worksheet routing it gets
/// through the environment. Required stages abort the whole run on failure;
/// optional ones are logged and skipped.
struct Stage {
    label: &'static str,
    binary: &'static str,
    required: bool,
    env: &'static [(&'static str, &'static str)],
}

const STAGES: [Stage; 6] = [
    Stage {
        label: "bookmarks",
        binary: "bookmarks",
        required: true,
        env: &[],
    },
    Stage {
        label: "regenerator (advertising)",
        binary: "regenerator",
        required: true,
        env: &[
            ("SOURCE_WORKSHEET", "marketing"),
            ("TARGET_WORKSHEET", "advertising"),
        ],
    },
    Stage {
        label: "xls-import",
        binary: "xls-import",
        required: false,
        env: &[],
    },
    Stage {
        label: "gallery",
        binary: "gallery",
        required: false,
        env: &[],
    },
    Stage {
        label: "regenerator (support)",
        binary: "regenerator",
        required: true,
        env: &[
            ("SOURCE_WORKSHEET", "support business"),
            ("TARGET_WORKSHEET", "information"),
        ],
    },
    Stage {
        label: "regenerator (imported)",
        binary: "regenerator",
        required: false,
        env: &[
            ("SOURCE_WORKSHEET", "xls"),
            ("TARGET_WORKSHEET", "information"),
        ],
    },
];

/// Prefers the binary sitting next to the runner itself, falling back to
/// PATH lookup.
fn resolve_binary(name: &str) -> PathBuf {
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(name);
            if sibling.is_file() {
                return sibling;
            }
        }
    }
    PathBuf::from(name)
}

fn run_stage(stage: &Stage) -> Result<()> {
    let binary = resolve_binary(stage.binary);
    info!("Running stage '{}' ({})", stage.label, binary.display());

    let status = Command::new(&binary)
        .envs(stage.env.iter().copied())
        .status()
        .with_context(|| format!("Failed to spawn '{}'", binary.display()))?;

    if !status.success() {
        bail!("Stage '{}' exited with {}", stage.label, status);
    }
    info!("Stage '{}' completed", stage.label);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    info!("Starting pipeline run");

    for stage in &STAGES {
        match run_stage(stage) {
            Ok(()) => {}
            Err(e) if stage.required => {
                error!("Required stage '{}' failed: {:#}", stage.label, e);
                bail!("Pipeline aborted at required stage '{}'", stage.label);
            }
            Err(e) => {
                warn!("Optional stage '{}' failed: {:#}, continuing", stage.label, e);
            }
        }
    }

    info!("Pipeline run completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_stages_cover_the_main_flow() {
        let required: Vec<&str> = STAGES
            .iter()
            .filter(|s| s.required)
            .map(|s| s.label)
            .collect();
        assert_eq!(
            required,
            vec![
                "bookmarks",
                "regenerator (advertising)",
                "regenerator (support)"
            ]
        );
    }

    #[test]
    fn regenerator_stages_route_worksheets() {
        for stage in STAGES.iter().filter(|s| s.binary == "regenerator") {
            let keys: Vec<&str> = stage.env.iter().map(|(k, _)| *k).collect();
            assert!(keys.contains(&"SOURCE_WORKSHEET"));
            assert!(keys.contains(&"TARGET_WORKSHEET"));
        }
    }

    #[test]
    fn unknown_binary_falls_back_to_path_lookup() {
        let path = resolve_binary("definitely-not-a-real-binary");
        assert_eq!(path, PathBuf::from("definitely-not-a-real-binary"));
    }
}

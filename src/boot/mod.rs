//! extlinux installation and boot menu generation.
//!
//! Every stanza boots from the same filesystem, selected by UUID; the
//! `live_dir` parameter tells the Live runtime which architecture's
//! payload directory to use.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::config::MenuTheme;
use crate::error::{StageError, StageResult};
use crate::process::{Cmd, CommandRunner};

/// Name of the generated menu configuration inside the boot directory.
pub const CONFIG_FILENAME: &str = "extlinux.conf";

/// Menu colors. Presentation only.
const MENU_COLORS: &[&str] = &[
    "border 0 #ffffffff #00000000",
    "sel 7 #ffffffff #ff000000",
    "title 0 #ffffffff #00000000",
    "tabmsg 0 #ffffffff #00000000",
    "unsel 0 #ffffffff #00000000",
    "hotsel 0 #ff000000 #ffffffff",
    "hotkey 7 #ffffffff #ff000000",
    "timeout_msg 0 #ffffffff #00000000",
    "timeout 0 #ffffffff #00000000",
    "cmdline 0 #ffffffff #00000000",
];

/// One selectable menu entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub arch: String,
    /// Kernel filename relative to the boot directory.
    pub kernel: String,
    /// Initrd filename relative to the boot directory.
    pub initrd: String,
    /// Absolute path of the Live payload directory inside the filesystem.
    pub live_dir: String,
}

/// A stanza read back from a generated config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedStanza {
    pub label: String,
    pub kernel: String,
    pub initrd: String,
    pub root_uuid: String,
    pub live_dir: String,
}

/// Install the extlinux boot files into `boot_dir`.
pub fn install(runner: &dyn CommandRunner, boot_dir: &Path) -> StageResult<()> {
    Cmd::new("extlinux")
        .arg("--install")
        .arg_path(boot_dir)
        .error_msg("extlinux install failed")
        .run(runner)?;
    info!(boot_dir = %boot_dir.display(), "extlinux installed");
    Ok(())
}

/// Read the filesystem UUID that formatting assigned to `device`.
pub fn uuid_of(runner: &dyn CommandRunner, device: &str) -> StageResult<String> {
    let result = Cmd::new("blkid")
        .args(["-c", "/dev/null", "-s", "UUID", "-o", "value"])
        .arg(device)
        .error_msg("blkid failed")
        .run(runner)?;
    let uuid = result.stdout.trim();
    if uuid.is_empty() {
        return Err(StageError::MissingUuid(device.to_string()));
    }
    Ok(uuid.to_string())
}

/// Render the menu configuration.
pub fn render_config(theme: &MenuTheme, uuid: &str, entries: &[BootEntry]) -> String {
    let mut out = format!(
        "default vesamenu.c32\n\
         timeout {}\n\
         \n\
         menu background {}\n\
         menu title {}\n",
        theme.timeout, theme.background, theme.title
    );
    for color in MENU_COLORS {
        out.push_str(&format!("menu color {}\n", color));
    }
    out.push_str("menu hidden\nmenu hiddenrow 5\n");

    for entry in entries {
        out.push_str(&stanza(&theme.label_prefix, uuid, entry));
    }
    out
}

fn stanza(label_prefix: &str, uuid: &str, entry: &BootEntry) -> String {
    let label = format!("{}-{}", label_prefix, entry.arch);
    format!(
        "\n\
         label {label}\n  \
         menu label {label}\n  \
         kernel {kernel}\n  \
         append initrd={initrd} root=UUID={uuid} rootfstype=auto ro live_dir={live_dir} liveimg\n",
        label = label,
        kernel = entry.kernel,
        initrd = entry.initrd,
        uuid = uuid,
        live_dir = entry.live_dir,
    )
}

/// Write the menu configuration to `path`.
pub fn write_config(path: &Path, theme: &MenuTheme, uuid: &str, entries: &[BootEntry]) -> StageResult<()> {
    fs::write(path, render_config(theme, uuid, entries))
        .map_err(|e| StageError::io(format!("writing boot config '{}'", path.display()), e))?;
    info!(path = %path.display(), uuid, entries = entries.len(), "boot config written");
    Ok(())
}

/// Parse the stanzas of a config produced by [`render_config`].
pub fn parse_stanzas(text: &str) -> Vec<ParsedStanza> {
    let mut stanzas: Vec<ParsedStanza> = Vec::new();
    for line in text.lines().map(str::trim) {
        let Some((keyword, rest)) = line.split_once(' ') else {
            continue;
        };
        if keyword == "label" {
            stanzas.push(ParsedStanza {
                label: rest.trim().to_string(),
                ..Default::default()
            });
            continue;
        }
        let Some(current) = stanzas.last_mut() else {
            continue;
        };
        match keyword {
            "kernel" => current.kernel = rest.trim().to_string(),
            "append" => {
                for param in rest.split_whitespace() {
                    if let Some(v) = param.strip_prefix("initrd=") {
                        current.initrd = v.to_string();
                    } else if let Some(v) = param.strip_prefix("root=UUID=") {
                        current.root_uuid = v.to_string();
                    } else if let Some(v) = param.strip_prefix("live_dir=") {
                        current.live_dir = v.to_string();
                    }
                }
            }
            _ => {}
        }
    }
    stanzas
}

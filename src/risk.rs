//! Static classification of action ids by how hard they are to undo.
//!
//! The destructive set, the high-risk set and the warning table are
//! independent data. Keep them in step by hand when adding actions.

/// Actions whose effects are hard to reverse without a restore point.
const DESTRUCTIVE_ACTIONS: &[&str] = &[
    "bloatware-remove",
    "services-disable",
    "driver-clean",
    "cleanup-run",
    "registry-apply",
    "tls-hardening",
    "firewall-hardening",
    "smart-optimize-aggressive",
    "ui-online-content-disable",
    "ui-secure-recent-docs",
    "ui-remove-this-pc-folders",
    "ui-lock-screen-notifications-disable",
    "ui-store-open-with-disable",
    "ui-quick-access-recent-disable",
    "ui-sync-provider-notifications-disable",
    "ui-hibernation-disable",
    "ui-camera-osd-enable",
    "copilot-disable",
    "security-improve-network",
    "security-clipboard-data-disable",
    "security-spectre-meltdown-enable",
    "security-dep-enable",
    "security-autorun-disable",
    "security-lock-screen-camera-disable",
    "security-lm-hash-disable",
    "security-always-install-elevated-disable",
    "security-sehop-enable",
    "security-ps2-downgrade-protection-enable",
    "security-wcn-disable",
    "amd-driver-install",
];

/// Actions likely to break major functionality or destabilize the system.
const HIGH_RISK_ACTIONS: &[&str] = &[
    "services-disable",
    "driver-clean",
    "tls-hardening",
    "firewall-hardening",
    "security-spectre-meltdown-enable",
    "security-improve-network",
];

/// Curated warnings; `{name}` is replaced with the display name.
const WARNINGS: &[(&str, &str)] = &[
    (
        "bloatware-remove",
        "'{name}' will uninstall pre-installed Windows apps.\n\n\
         Some apps may be difficult to reinstall. Make sure you have a restore point.",
    ),
    (
        "services-disable",
        "'{name}' will disable Windows services.\n\n\
         WARNING: This may break Windows features like printing, Bluetooth, or remote desktop.\n\
         A system restore point is STRONGLY recommended.",
    ),
    (
        "driver-clean",
        "'{name}' will remove GPU drivers using DDU.\n\n\
         Your display may go blank temporarily. Have a new driver ready to install.",
    ),
    (
        "cleanup-run",
        "'{name}' will delete temporary files and caches.\n\n\
         This is generally safe but cannot be undone.",
    ),
    (
        "registry-apply",
        "'{name}' will modify Windows registry settings.\n\n\
         A restore point is recommended before proceeding.",
    ),
    (
        "tls-hardening",
        "'{name}' will disable legacy TLS/SSL protocols.\n\n\
         WARNING: This may break connectivity with older websites, VPNs, or enterprise systems.",
    ),
    (
        "firewall-hardening",
        "'{name}' will modify Windows Firewall policies.\n\n\
         This changes default inbound/outbound rules for all profiles. \
         Some applications may be blocked.",
    ),
    (
        "security-improve-network",
        "'{name}' will harden SMB/NetBIOS and disable legacy network components.\n\n\
         WARNING: This may break file sharing, remote access, or older devices on your network.",
    ),
    (
        "security-spectre-meltdown-enable",
        "'{name}' will enable Spectre/Meltdown CPU mitigations.\n\n\
         WARNING: This may reduce CPU performance by 5-30% depending on workload.",
    ),
    (
        "security-clipboard-data-disable",
        "'{name}' will disable clipboard sync and history.\n\n\
         Clipboard sync across devices and history will stop working.",
    ),
    (
        "security-ps2-downgrade-protection-enable",
        "'{name}' will disable PowerShell 2.0 optional features.\n\n\
         Legacy scripts requiring PowerShell 2.0 may stop working.",
    ),
    (
        "smart-optimize-aggressive",
        "'{name}' applies aggressive network adapter changes.\n\n\
         It may disable Flow Control/Jumbo Frames and force Interrupt Moderation.\n\
         This can reduce throughput on some LANs or increase latency.",
    ),
    (
        "copilot-disable",
        "'{name}' will disable Windows Copilot.\n\n\
         This removes the Copilot app and sets group policy to prevent it from running.",
    ),
    (
        "ui-remove-this-pc-folders",
        "'{name}' will hide standard folders from This PC.\n\n\
         The folders remain on disk, but Explorer shortcuts will be hidden.",
    ),
    (
        "ui-hibernation-disable",
        "'{name}' will disable hibernation.\n\n\
         This removes hiberfil.sys and may affect Fast Startup and sleep behavior.",
    ),
    (
        "amd-driver-install",
        "AMD's driver download page will open in your browser.\n\n\
         Click 'Download Windows Drivers' on the AMD page to get the latest Auto-Detect installer.\n\
         The installer will detect your GPU and download the correct driver.",
    ),
];

const GENERIC_WARNING: &str =
    "'{name}' will make changes to your system.\n\nAre you sure you want to proceed?";

/// Whether the action needs an explicit confirmation (exact match).
pub fn requires_confirmation(action: &str) -> bool {
    DESTRUCTIVE_ACTIONS.contains(&action)
}

pub fn is_high_risk(action: &str) -> bool {
    HIGH_RISK_ACTIONS.contains(&action)
}

/// Warning text for `action`, naming it by `display_name`.
pub fn warning(action: &str, display_name: &str) -> String {
    WARNINGS
        .iter()
        .find(|(id, _)| *id == action)
        .map_or(GENERIC_WARNING, |(_, template)| *template)
        .replace("{name}", display_name)
}

/// Content of a confirmation dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub action: String,
    pub title: &'static str,
    pub header: &'static str,
    pub body: String,
    pub high_risk: bool,
}

/// Builds the confirmation for a destructive action, `None` otherwise.
pub fn confirmation(action: &str, display_name: &str) -> Option<Confirmation> {
    if !requires_confirmation(action) {
        return None;
    }
    let high_risk = is_high_risk(action);
    Some(Confirmation {
        action: action.to_string(),
        title: if high_risk {
            "High-Risk Operation"
        } else {
            "Confirm Action"
        },
        header: if high_risk {
            "This operation may cause system instability!"
        } else {
            "Are you sure you want to proceed?"
        },
        body: warning(action, display_name),
        high_risk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(requires_confirmation("bloatware-remove"));
        assert!(!is_high_risk("bloatware-remove"));

        assert!(requires_confirmation("services-disable"));
        assert!(is_high_risk("services-disable"));

        assert!(!requires_confirmation("gamebar-off"));
        assert!(!is_high_risk("gamebar-off"));
    }

    #[test]
    fn test_membership_is_case_sensitive() {
        assert!(!requires_confirmation("Services-Disable"));
        assert!(!is_high_risk("SERVICES-DISABLE"));
    }

    #[test]
    fn test_high_risk_entries_are_destructive() {
        // Data convention, not a structural rule
        for action in HIGH_RISK_ACTIONS {
            assert!(requires_confirmation(action), "{action}");
        }
    }

    #[test]
    fn test_curated_warning() {
        let text = warning("services-disable", "Disable Services");
        assert!(text.contains("Disable Services"));
        assert!(text.contains("STRONGLY recommended"));
        assert!(!text.contains("{name}"));
    }

    #[test]
    fn test_generic_warning_fallback() {
        let text = warning("unknown-action", "X");
        assert!(text.contains("'X'"));
        assert!(text.contains("changes to your system"));
    }

    #[test]
    fn test_every_curated_warning_names_the_action() {
        for (id, _) in WARNINGS {
            if *id == "amd-driver-install" {
                continue;
            }
            assert!(warning(id, "Name Here").contains("Name Here"), "{id}");
        }
    }

    #[test]
    fn test_confirmation_content() {
        let high = confirmation("tls-hardening", "TLS Hardening").unwrap();
        assert!(high.high_risk);
        assert_eq!(high.title, "High-Risk Operation");
        assert!(high.body.contains("TLS Hardening"));

        let normal = confirmation("cleanup-run", "Cleanup").unwrap();
        assert!(!normal.high_risk);
        assert_eq!(normal.title, "Confirm Action");

        assert!(confirmation("gamebar-off", "Game Bar").is_none());
    }
}

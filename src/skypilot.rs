//! Pure parsers for sky CLI output.
//!
//! The CLI's text output is not a stable contract, so everything here is
//! tolerant scanning: status tables, credential-check listings, and stderr
//! classification. No IO.

use std::collections::BTreeMap;

use crate::cluster::ClusterStatus;

/// Maximum length of a fallback error line before truncation.
const MAX_ERROR_LEN: usize = 200;

/// How many lines below a `<Provider>: disabled` entry to scan for a reason.
const REASON_LOOKAHEAD: usize = 3;

/// Parse `sky status` tabular output into a lifecycle state.
///
/// A line is relevant only if one of its whitespace tokens equals the
/// cluster name exactly — token equality, not substring search, so
/// `carapace-node-2` never matches `carapace-node`. Absence of any
/// matching line means the cluster is gone or was never created.
pub fn parse_status(stdout: &str, cluster_name: &str) -> ClusterStatus {
    for line in stdout.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if !tokens.iter().any(|t| *t == cluster_name) {
            continue;
        }
        for token in &tokens {
            if token.eq_ignore_ascii_case("UP") {
                return ClusterStatus::Running;
            }
            if token.eq_ignore_ascii_case("STOPPED") {
                return ClusterStatus::Stopped;
            }
            if token.eq_ignore_ascii_case("INIT") {
                return ClusterStatus::Provisioning;
            }
        }
    }
    ClusterStatus::NoServer
}

/// Result of parsing `sky check` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    pub enabled: Vec<String>,
    /// Disabled provider → reason string.
    pub disabled: BTreeMap<String, String>,
}

/// Parse `sky check` output into enabled/disabled cloud providers.
pub fn parse_check(output: &str) -> CheckOutcome {
    let mut outcome = CheckOutcome::default();
    let stripped = strip_ansi(output);
    let lines: Vec<&str> = stripped.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        let Some((provider, enabled)) = provider_line(line.trim()) else {
            continue;
        };
        if enabled {
            outcome.enabled.push(provider);
            continue;
        }
        // Look ahead a few lines for a "Reason: ..." continuation,
        // stopping early if another provider entry appears first.
        let mut reason = "unknown".to_string();
        for next in lines.iter().skip(i + 1).take(REASON_LOOKAHEAD) {
            let next = next.trim();
            if let Some(text) = next.strip_prefix("Reason:") {
                reason = text.trim().to_string();
                break;
            }
            if provider_line(next).is_some() {
                break;
            }
        }
        outcome.disabled.insert(provider, reason);
    }

    outcome
}

/// Match a trimmed line of the form `<Provider>: enabled [...]` or
/// `<Provider>: disabled`. The provider name may contain spaces
/// ("Lambda Cloud") and is lower-cased for the result.
fn provider_line(line: &str) -> Option<(String, bool)> {
    let (name, rest) = line.split_once(':')?;
    let name = name.trim();
    let mut chars = name.chars();
    if !chars.next()?.is_ascii_alphanumeric() {
        return None;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ')
    {
        return None;
    }
    // The original format always has whitespace between colon and state
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let state = rest.split_whitespace().next()?;
    if state.eq_ignore_ascii_case("enabled") {
        Some((name.to_ascii_lowercase(), true))
    } else if state.eq_ignore_ascii_case("disabled") {
        Some((name.to_ascii_lowercase(), false))
    } else {
        None
    }
}

/// Classify sky stderr into a human-readable message.
///
/// Known failure signatures map to fixed messages; anything else falls back
/// to the last non-empty line of stderr, truncated.
pub fn extract_error(stderr: &str) -> String {
    if stderr.contains("Credentials not found") || stderr.contains("credentials not found") {
        return "Cloud credentials not configured. Run `sky check` for setup instructions.".into();
    }
    if stderr.contains("No cloud access") || stderr.contains("NoCloudAccessError") {
        return "No cloud provider enabled. Run `sky check` for setup instructions.".into();
    }
    if stderr.contains("ResourcesUnavailableError") {
        if stderr.contains("Catalog does not contain") {
            return "No matching instance type found. Try relaxing resource requirements.".into();
        }
        return "Requested resources unavailable. Try a different region or instance type.".into();
    }
    if stderr.contains("Failed to provision") {
        return "Cloud provider could not allocate resources. Check quotas and try again.".into();
    }

    match stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        Some(last) if last.chars().count() > MAX_ERROR_LEN => {
            let truncated: String = last.chars().take(MAX_ERROR_LEN).collect();
            format!("{truncated}...")
        }
        Some(last) => last.to_string(),
        None => "Unknown error occurred".into(),
    }
}

/// Strip ANSI SGR escape sequences (`ESC [ ... m`).
fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for c2 in chars.by_ref() {
                if !c2.is_ascii_digit() && c2 != ';' {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_status ────────────────────────────────────────────────

    #[test]
    fn status_up_is_running() {
        let stdout = "NAME            LAUNCHED     RESOURCES            STATUS   AUTOSTOP  COMMAND\n\
                      carapace-node   2 mins ago   1x AWS(m5.xlarge)    UP       60 min    sky launch ...";
        assert_eq!(parse_status(stdout, "carapace-node"), ClusterStatus::Running);
    }

    #[test]
    fn status_stopped() {
        let stdout = "NAME            LAUNCHED   RESOURCES           STATUS    AUTOSTOP  COMMAND\n\
                      carapace-node   1 hr ago   1x AWS(m5.xlarge)   STOPPED   -         sky launch ...";
        assert_eq!(parse_status(stdout, "carapace-node"), ClusterStatus::Stopped);
    }

    #[test]
    fn status_init_is_provisioning() {
        let stdout = "NAME            LAUNCHED   RESOURCES           STATUS  AUTOSTOP  COMMAND\n\
                      carapace-node   just now   1x AWS(m5.xlarge)   INIT    60 min    sky launch ...";
        assert_eq!(
            parse_status(stdout, "carapace-node"),
            ClusterStatus::Provisioning
        );
    }

    #[test]
    fn status_other_cluster_is_no_server() {
        let stdout = "NAME            LAUNCHED     RESOURCES          STATUS  AUTOSTOP  COMMAND\n\
                      other-cluster   2 mins ago   1x GCP(n1-std-4)   UP      60 min    sky launch ...";
        assert_eq!(parse_status(stdout, "carapace-node"), ClusterStatus::NoServer);
    }

    #[test]
    fn status_partial_name_does_not_match() {
        let stdout = "carapace-node-staging  1m ago  1x AWS  UP  -  sky launch ...";
        assert_eq!(parse_status(stdout, "carapace-node"), ClusterStatus::NoServer);
    }

    #[test]
    fn status_empty_and_header_only_are_no_server() {
        assert_eq!(parse_status("", "carapace-node"), ClusterStatus::NoServer);
        let headers = "NAME  LAUNCHED  RESOURCES  STATUS  AUTOSTOP  COMMAND\n";
        assert_eq!(parse_status(headers, "carapace-node"), ClusterStatus::NoServer);
    }

    // ── parse_check ─────────────────────────────────────────────────

    #[test]
    fn check_extracts_enabled_clouds() {
        let out = "Checking credentials to enable clouds for SkyPilot.\n\
                   \x20 AWS: enabled [compute, storage]\n\
                   \x20 GCP: enabled [compute, storage]\n\
                   \x20 Azure: disabled\n\
                   \x20   Reason: ~/.azure/msal_token_cache.json does not exist. Run: az login";
        let result = parse_check(out);
        assert_eq!(result.enabled, vec!["aws", "gcp"]);
        assert!(!result.enabled.contains(&"azure".to_string()));
    }

    #[test]
    fn check_extracts_disabled_reasons() {
        let out = "  AWS: enabled [compute, storage]\n\
                   \x20 Azure: disabled\n\
                   \x20   Reason: ~/.azure/msal_token_cache.json does not exist\n\
                   \x20 Lambda: disabled\n\
                   \x20   Reason: Credentials not found";
        let result = parse_check(out);
        assert!(result.disabled["azure"].contains("does not exist"));
        assert!(result.disabled["lambda"].contains("Credentials not found"));
    }

    #[test]
    fn check_disabled_without_reason_is_unknown() {
        let result = parse_check("  Kubernetes: disabled\n");
        assert_eq!(result.disabled["kubernetes"], "unknown");
    }

    #[test]
    fn check_reason_lookahead_stops_at_next_provider() {
        let out = "  Azure: disabled\n\
                   \x20 GCP: enabled [compute]\n\
                   \x20   Reason: this belongs to nobody";
        let result = parse_check(out);
        assert_eq!(result.disabled["azure"], "unknown");
        assert_eq!(result.enabled, vec!["gcp"]);
    }

    #[test]
    fn check_handles_ansi_colored_output() {
        let out = "  \x1b[32mAWS\x1b[0m: enabled [compute]\n";
        let result = parse_check(out);
        assert_eq!(result.enabled, vec!["aws"]);
    }

    #[test]
    fn check_multi_word_provider_names() {
        let out = "  Lambda Cloud: disabled\n    Reason: Credentials not found";
        let result = parse_check(out);
        assert!(result.disabled["lambda cloud"].contains("Credentials not found"));
    }

    #[test]
    fn check_no_clouds_is_empty() {
        let result = parse_check("No output");
        assert!(result.enabled.is_empty());
        assert!(result.disabled.is_empty());
    }

    // ── extract_error ───────────────────────────────────────────────

    #[test]
    fn error_credentials_not_found() {
        let msg = extract_error("sky.exceptions.SomeError: Credentials not found for AWS");
        assert!(msg.contains("credentials not configured"));
    }

    #[test]
    fn error_no_cloud_access() {
        let msg =
            extract_error("sky.exceptions.NoCloudAccessError: No cloud access credentials found.");
        assert!(msg.contains("No cloud provider enabled"));
    }

    #[test]
    fn error_resources_unavailable() {
        let msg = extract_error(
            "sky.exceptions.ResourcesUnavailableError: Failed to provision all possible launchable resources.",
        );
        assert!(msg.contains("unavailable"));
    }

    #[test]
    fn error_catalog_mismatch() {
        let msg = extract_error(
            "sky.exceptions.ResourcesUnavailableError: Catalog does not contain any instances satisfying the request.",
        );
        assert!(msg.contains("No matching instance type"));
    }

    #[test]
    fn error_failed_to_provision() {
        let msg = extract_error("Failed to provision resources in us-east-1a.");
        assert!(msg.contains("could not allocate resources"));
    }

    #[test]
    fn error_unknown_returns_last_line() {
        let msg = extract_error("some random error\nthe actual error message");
        assert_eq!(msg, "the actual error message");
    }

    #[test]
    fn error_long_line_is_truncated() {
        let long = "x".repeat(300);
        let msg = extract_error(&long);
        assert_eq!(msg.len(), MAX_ERROR_LEN + 3);
        assert!(msg.ends_with("..."));
    }

    #[test]
    fn error_empty_stderr_is_unknown() {
        assert_eq!(extract_error(""), "Unknown error occurred");
    }
}

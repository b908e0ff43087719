//! Rendu texte des réponses du canal de contrôle (messages Telegram bruts).

use std::fmt::Write;

use dms_control::commands::{API_FORMAT, SHELL_FORMAT};
use dms_control::response::{Confirmation, HostLine, HostListing, LISTING_LIMIT, StatusReport};
use dms_control::{ControlError, ControlResult, Response};
use dms_hosts::{HostKind, ShutdownReport, ShutdownStatus};

/// Longueur du détail d'un résultat d'arrêt dans le bilan
const DETAIL_CHARS: usize = 50;

pub fn render(result: &ControlResult<Response>) -> String {
    match result {
        Ok(response) => render_response(response),
        Err(e) => render_error(e),
    }
}

pub fn render_error(error: &ControlError) -> String {
    match error {
        ControlError::Unauthorized => "⛔ Unauthorized".to_string(),
        ControlError::NotAuthenticated => "🔐 Authentication required, use /login".to_string(),
        ControlError::InvalidCredential => "❌ Invalid credential, start again".to_string(),
        ControlError::MalformedInput(_) => format!("❌ {error}\nSend /start for the menu."),
        other => format!("❌ {other}"),
    }
}

fn render_response(response: &Response) -> String {
    match response {
        Response::Menu { authenticated: true } => MENU_AUTHENTICATED.to_string(),
        Response::Menu { authenticated: false } => {
            "🛡️ Dead Man's Switch\n\nAuthenticate with /login to access the control panel."
                .to_string()
        }
        Response::AskSecret => "🔐 Authentication (step 1/2)\n\nSend the static token.".to_string(),
        Response::AskCode => {
            "✅ Token verified\n\n🔐 Authentication (step 2/2)\n\nSend your TOTP code.".to_string()
        }
        Response::Authenticated { expires_at } => {
            format!("✅ Authenticated\nSession expires {}\n\n{MENU_AUTHENTICATED}", format_time(*expires_at))
        }
        Response::LoggedOut { had_session: true } => "✅ Logged out".to_string(),
        Response::LoggedOut { had_session: false } => "ℹ️ Not authenticated".to_string(),
        Response::Status(report) => render_status(report),
        Response::Hosts(listing) => render_listing(listing),
        Response::AddShellInstructions {
            public_key,
            sudoers_line,
        } => {
            let key = public_key
                .as_deref()
                .unwrap_or("(public key unavailable, check DMS_SSH_KEY_PATH)");
            format!(
                "➕ Add SSH host\n\n1. Append this key to ~/.ssh/authorized_keys on the target:\n{key}\n\n\
                 2. Allow passwordless shutdown (visudo):\n{sudoers_line}\n\n\
                 3. Send: {SHELL_FORMAT}"
            )
        }
        Response::AddApiInstructions { types } => format!(
            "➕ Add API host\n\nFormat: {API_FORMAT}\nAvailable types: {}\n\nExample:\n\
             api:vcenter:vcenter.local:admin@vsphere.local:password:vCenter",
            types.join(", ")
        ),
        Response::AskSelection { hosts } => {
            let mut text = String::from("⚡ Selective shutdown\n\n");
            for line in hosts {
                let _ = writeln!(text, "{}. {} [{}]", line.index, line.label, line.status);
            }
            text.push_str("\nSend the hosts to shut down: 1,3,5 or 1-4 or all");
            text
        }
        Response::AwaitingCode(confirmation) => render_confirmation(confirmation),
        Response::HostAdded { label, status } => {
            let status = status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into());
            format!("✅ Host added: {label}\nStatus: {status}")
        }
        Response::HostRemoved { label } => format!("✅ Host removed: {label}"),
        Response::Shutdown(report) => render_report(report),
    }
}

const MENU_AUTHENTICATED: &str = "🛡️ Control panel\n\n\
/status - system status\n\
/ssh - list SSH hosts\n\
/api - list API hosts\n\
/addssh - add SSH host\n\
/addapi - add API host\n\
/rmssh <host> <user> - remove SSH host\n\
/rmapi <host> - remove API host\n\
/shutdown - emergency shutdown (all)\n\
/select - selective shutdown\n\
/logout - end session";

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

fn render_status(report: &StatusReport) -> String {
    let mut text = String::from("📊 System status\n\n");
    if report.progress.in_progress {
        let _ = writeln!(text, "⚠️ SHUTDOWN IN PROGRESS");
        let _ = writeln!(text, "Phase: {}", report.progress.phases.join(", "));
        let started = report.progress.started_at.map(format_time).unwrap_or_else(|| "N/A".into());
        let _ = writeln!(text, "Started: {started}\n");
    } else {
        text.push_str("✅ System operational\n\n");
    }

    for (name, counts) in [("SSH", &report.shell), ("API", &report.api)] {
        let _ = writeln!(
            text,
            "{name}: {}/{} online ({} offline, {} disabled)",
            counts.online,
            counts.total - counts.disabled,
            counts.offline,
            counts.disabled
        );
    }

    if !report.attention.is_empty() {
        text.push_str("\nNeeds attention:\n");
        for line in &report.attention {
            let _ = write!(text, "• {} [{}]", line.label, line.status);
            if let Some(error) = &line.error {
                let _ = write!(text, ": {error}");
            }
            text.push('\n');
        }
    }
    text
}

fn render_listing(listing: &HostListing) -> String {
    let title = match listing.kind {
        HostKind::Shell => "SSH hosts",
        HostKind::Api => "API hosts",
    };
    if listing.hosts.is_empty() {
        return format!("📋 No {title} configured");
    }

    let mut text = format!("📋 {title}\n\n");
    for line in &listing.hosts {
        text.push_str(&host_line(line));
        text.push('\n');
    }
    if listing.remaining > 0 {
        let _ = writeln!(text, "…and {} more", listing.remaining);
    }
    text
}

fn host_line(line: &HostLine) -> String {
    let marker = match line.status {
        dms_hosts::HostStatus::Online => "🟢",
        dms_hosts::HostStatus::Offline => "🔴",
        dms_hosts::HostStatus::Unknown => "⚪",
    };
    let mut out = format!("{}. {marker} {}", line.index, line.label);
    if !line.enabled {
        out.push_str(" (disabled)");
    }
    if !line.description.is_empty() {
        let _ = write!(out, " - {}", line.description);
    }
    out
}

fn bullet_list(text: &mut String, items: &[String]) {
    for item in items.iter().take(LISTING_LIMIT) {
        let _ = writeln!(text, "• {item}");
    }
    if items.len() > LISTING_LIMIT {
        let _ = writeln!(text, "…and {} more", items.len() - LISTING_LIMIT);
    }
}

fn render_confirmation(confirmation: &Confirmation) -> String {
    let mut text = String::new();
    match confirmation {
        Confirmation::Shutdown { hosts } => {
            let _ = writeln!(text, "🔴 EMERGENCY SHUTDOWN\n\nThis will shut down {} host(s):", hosts.len());
            bullet_list(&mut text, hosts);
        }
        Confirmation::SelectiveShutdown { hosts } => {
            let _ = writeln!(text, "⚠️ Confirm selective shutdown\n\nSelected {} host(s):", hosts.len());
            bullet_list(&mut text, hosts);
        }
        Confirmation::AddShell { label, description } | Confirmation::AddApi { label, description } => {
            let _ = writeln!(text, "✅ Connection test successful\n\nAdd: {label}");
            if !description.is_empty() {
                let _ = writeln!(text, "Description: {description}");
            }
        }
        Confirmation::RemoveShell { label } | Confirmation::RemoveApi { label } => {
            let _ = writeln!(text, "⚠️ Remove host: {label}");
        }
    }
    text.push_str("\nSend your TOTP code to confirm.");
    text
}

fn render_report(report: &ShutdownReport) -> String {
    if report.total_count() == 0 {
        return "ℹ️ Shutdown sequence complete\n\nNo host to shut down.".to_string();
    }

    let mut text = String::from("🔴 Shutdown sequence complete\n");
    for phase in &report.phases {
        let _ = writeln!(text, "\n{}:", phase.name);
        for outcome in &phase.outcomes {
            let mark = match outcome.status {
                ShutdownStatus::Executed | ShutdownStatus::Initiated => "✓",
                ShutdownStatus::Timeout => "⏱",
                ShutdownStatus::Failed => "✗",
            };
            let _ = write!(text, "  {mark} {}: {}", outcome.host_label, outcome.status);
            if let Some(detail) = &outcome.detail {
                let _ = write!(text, " ({})", dms_common::truncate_chars(detail, DETAIL_CHARS));
            }
            text.push('\n');
        }
    }
    let _ = write!(text, "\nSummary: {} hosts executed", report.summary());
    text
}

//! Terminal rendering for snapshots, events and disks. ASCII only.

use chrono::Local;
use installer_common::{
    DiskInfo, Event, EventEnvelope, InstallState, SessionSnapshot, StageError, StageStatus,
    TerminalOutcome,
};
use owo_colors::OwoColorize;
use std::fmt::Write;

pub fn state(state: InstallState) -> String {
    let label = state.as_str();
    match state {
        InstallState::Succeeded => label.bright_green().to_string(),
        InstallState::Failed => label.bright_red().to_string(),
        InstallState::Aborted | InstallState::StagePaused => label.yellow().to_string(),
        InstallState::Running => label.cyan().to_string(),
        InstallState::Idle | InstallState::Configuring => label.to_string(),
    }
}

fn marker(status: StageStatus) -> String {
    match status {
        StageStatus::Pending => "[  ]".dimmed().to_string(),
        StageStatus::Running => "[>>]".cyan().to_string(),
        StageStatus::Succeeded => "[OK]".bright_green().to_string(),
        StageStatus::Failed => "[!!]".bright_red().to_string(),
        StageStatus::Skipped => "[--]".dimmed().to_string(),
        StageStatus::Cancelled => "[XX]".yellow().to_string(),
    }
}

fn outcome(outcome: TerminalOutcome) -> String {
    state(outcome.state())
}

fn write_error(out: &mut String, error: &StageError) {
    let _ = writeln!(out, "  {}", error.summary.bright_red());
    if let Some(detail) = &error.detail {
        for line in detail.lines() {
            let _ = writeln!(out, "    {}", line.dimmed());
        }
    }
}

/// Full status view.
pub fn snapshot(snapshot: &SessionSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "State:   {}", state(snapshot.state));

    let Some(session) = &snapshot.session else {
        let _ = writeln!(out, "No install session. Use `installctl start` to begin.");
        return out;
    };

    let _ = writeln!(out, "Session: {}", session.id.to_string().dimmed());
    let _ = writeln!(
        out,
        "Target:  {}  host {}  user {}",
        session.config.target_disk.bold(),
        session.config.hostname,
        session.config.username
    );
    let _ = writeln!(
        out,
        "Locale:  {}  timezone {}",
        session.config.locale, session.config.timezone
    );
    let _ = writeln!(out);

    for stage in &session.stages {
        let mut line = format!("{} {}", marker(stage.status), stage.name);
        if stage.attempts > 1 {
            let _ = write!(line, " (attempt {})", stage.attempts);
        }
        if session.current_stage == Some(stage.position) && stage.status == StageStatus::Running {
            if let Some(progress) = &session.progress {
                if let Some(percent) = progress.percent {
                    let _ = write!(line, "  {}%", percent);
                }
                if let Some(text) = &progress.text {
                    let _ = write!(line, "  {}", text.dimmed());
                }
            }
        }
        let _ = writeln!(out, "  {}", line);
    }

    if let Some(error) = &session.paused_error {
        let name = session
            .current_stage
            .and_then(|i| session.stages.get(i))
            .map(|s| s.name.as_str())
            .unwrap_or("?");
        let _ = writeln!(out);
        let _ = writeln!(out, "Paused on '{}':", name);
        write_error(&mut out, error);
        let _ = writeln!(out, "Use `installctl retry`, `installctl skip` or `installctl abort`.");
    }
    if session.abort_requested && !snapshot.state.is_terminal() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", "Abort requested, waiting for the stage to stop".yellow());
    }
    if let (Some(result), Some(summary)) = (session.outcome, &session.summary) {
        let _ = writeln!(out);
        let _ = writeln!(out, "Outcome: {}  {}", outcome(result), summary);
    }
    out
}

/// One line (plus error detail) per event.
pub fn event(envelope: &EventEnvelope) -> String {
    let time = envelope.timestamp.with_timezone(&Local).format("%H:%M:%S");
    let prefix = format!("{:>5} {}", envelope.seq, time).dimmed().to_string();

    let mut out = match &envelope.event {
        Event::SessionStateChanged { state: s } => format!("{} state {}", prefix, state(*s)),
        Event::StageStarted { stage, attempt, .. } if *attempt > 1 => {
            format!("{} {} started (attempt {})", prefix, stage.bold(), attempt)
        }
        Event::StageStarted { stage, .. } => format!("{} {} started", prefix, stage.bold()),
        Event::StageProgress {
            stage,
            percent,
            text,
        } => {
            let mut line = format!("{} {}", prefix, stage);
            if let Some(percent) = percent {
                let _ = write!(line, " {:>3}%", percent);
            }
            if let Some(text) = text {
                let _ = write!(line, " {}", text.dimmed());
            }
            line
        }
        Event::StageCompleted {
            stage, outcome: o, ..
        } => format!("{} {} {} {}", prefix, marker(*o), stage.bold(), o),
        Event::InstallFinished {
            outcome: o,
            summary,
        } => format!("{} finished {}: {}", prefix, outcome(*o), summary),
    };

    if let Event::StageCompleted {
        error: Some(error), ..
    } = &envelope.event
    {
        out.push('\n');
        write_error(&mut out, error);
        while out.ends_with('\n') {
            out.pop();
        }
    }
    out
}

pub fn disks(disks: &[DiskInfo]) -> String {
    if disks.is_empty() {
        return "No candidate disks found.\n".to_string();
    }
    let mut out = String::new();
    let width = disks.iter().map(|d| d.path.len()).max().unwrap_or(0);
    for disk in disks {
        let mut flags = Vec::new();
        if disk.removable {
            flags.push("removable");
        }
        if disk.read_only {
            flags.push("read-only");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", flags.join(", ")).yellow().to_string()
        };
        let _ = writeln!(
            out,
            "{:<width$}  {:>6}  {}{}",
            disk.path,
            disk.size_display,
            disk.model,
            flags,
            width = width
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn envelope(event: Event) -> EventEnvelope {
        EventEnvelope {
            seq: 7,
            session_id: None,
            timestamp: Utc::now(),
            event,
        }
    }

    #[test]
    fn test_idle_snapshot_points_at_start() {
        let text = snapshot(&SessionSnapshot::idle(0));
        assert!(text.contains("idle"));
        assert!(text.contains("installctl start"));
    }

    #[test]
    fn test_failed_stage_event_includes_detail() {
        let text = event(&envelope(Event::StageCompleted {
            stage: "install-packages".to_string(),
            position: 4,
            attempt: 1,
            outcome: StageStatus::Failed,
            error: Some(StageError::new("mirror unreachable").with_detail("curl: (6)\nretrying")),
        }));
        assert!(text.contains("install-packages"));
        assert!(text.contains("mirror unreachable"));
        assert!(text.contains("curl: (6)"));
        assert!(!text.ends_with('\n'));
    }

    #[test]
    fn test_retry_attempt_is_shown() {
        let text = event(&envelope(Event::StageStarted {
            stage: "bootloader".to_string(),
            position: 5,
            attempt: 2,
        }));
        assert!(text.contains("attempt 2"));
    }

    #[test]
    fn test_disk_flags() {
        let text = disks(&[DiskInfo {
            path: "/dev/sdb".to_string(),
            model: "USB Stick".to_string(),
            size_bytes: 16 << 30,
            size_display: "16G".to_string(),
            removable: true,
            read_only: true,
        }]);
        assert!(text.contains("/dev/sdb"));
        assert!(text.contains("removable, read-only"));
        assert_eq!(disks(&[]), "No candidate disks found.\n");
    }
}

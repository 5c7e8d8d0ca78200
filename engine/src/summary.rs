// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Startup and stop summaries
//!
//! The summaries are built as plain lines first and logged afterwards, so
//! the engine and the supervising controller share the formatting.
//!

use crate::Route;

use serde::{Deserialize, Serialize};
use tracing::info;

/// How much the startup and stop summaries print.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupSummaryLevel {
    /// Nothing.
    Off,
    /// The totals line only.
    Oneline,
    /// Totals plus one line per route.
    #[default]
    Default,
    /// Like `Default`, plus the configuration ids of the routes.
    Verbose,
}

impl StartupSummaryLevel {
    fn per_route(&self) -> bool {
        matches!(self, StartupSummaryLevel::Default | StartupSummaryLevel::Verbose)
    }
}

/// One route line of a summary.
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryLine {
    pub status: String,
    pub id: String,
    pub uri: String,
    pub configuration_id: Option<String>,
    /// Appended as ` with {detail}`, used for the backoff of restarting routes.
    pub detail: Option<String>,
}

impl SummaryLine {
    pub fn of(route: &Route, status: &str) -> Self {
        Self {
            status: status.to_owned(),
            id: route.id().to_owned(),
            uri: route.endpoint_uri().to_owned(),
            configuration_id: route.configuration_id().map(str::to_owned),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: String) -> Self {
        self.detail = Some(detail);
        self
    }

    fn render(&self) -> String {
        match &self.detail {
            Some(detail) => format!("    {} {} ({}) with {}", self.status, self.id, self.uri, detail),
            None => format!("    {} {} ({})", self.status, self.id, self.uri),
        }
    }
}

fn count(lines: &[SummaryLine], status: &str) -> usize {
    lines.iter().filter(|line| line.status == status).count()
}

fn body(level: StartupSummaryLevel, header: String, lines: &[SummaryLine]) -> Vec<String> {
    let mut out = vec![header];
    if !level.per_route() {
        return out;
    }
    out.extend(lines.iter().map(SummaryLine::render));
    if level == StartupSummaryLevel::Verbose {
        out.push("Routes configuration:".to_owned());
        out.extend(lines.iter().filter_map(|line| {
            line.configuration_id
                .as_ref()
                .map(|cid| format!("    {} ({})", line.id, cid))
        }));
    }
    out
}

/// Summary of an engine start. Routes with auto startup disabled are
/// expected with status `Disabled`.
pub fn startup_summary(level: StartupSummaryLevel, lines: &[SummaryLine]) -> Vec<String> {
    if level == StartupSummaryLevel::Off {
        return Vec::new();
    }
    let total = lines.len();
    let started = count(lines, "Started");
    let disabled = count(lines, "Disabled");
    let header = if disabled > 0 {
        format!("Routes startup (total:{} started:{} disabled:{})", total, started, disabled)
    } else if total != started {
        format!("Routes startup (total:{} started:{})", total, started)
    } else {
        format!("Routes startup (started:{})", started)
    };
    body(level, header, lines)
}

/// Summary of the supervised startup, counting restarting and exhausted
/// routes.
pub fn supervised_startup_summary(
    level: StartupSummaryLevel,
    lines: &[SummaryLine],
) -> Vec<String> {
    if level == StartupSummaryLevel::Off {
        return Vec::new();
    }
    let total = lines.len();
    let started = count(lines, "Started");
    let restarting = count(lines, "Restarting");
    let exhausted = count(lines, "Exhausted");
    let header = if restarting == 0 && exhausted == 0 {
        format!("Routes startup (total:{} started:{})", total, started)
    } else {
        format!(
            "Routes startup (total:{} started:{} restarting:{} exhausted:{})",
            total, started, restarting, exhausted
        )
    };
    body(level, header, lines)
}

/// Summary of an engine stop. Forced routes are expected with status
/// `Forced stopped`. The configuration section is never printed.
pub fn stop_summary(level: StartupSummaryLevel, lines: &[SummaryLine]) -> Vec<String> {
    if level == StartupSummaryLevel::Off {
        return Vec::new();
    }
    let total = lines.len();
    let forced = count(lines, "Forced stopped");
    let stopped = count(lines, "Stopped") + forced;
    let header = if forced > 0 {
        format!("Routes stopped (total:{} stopped:{} forced:{})", total, stopped, forced)
    } else if total != stopped {
        format!("Routes stopped (total:{} stopped:{})", total, stopped)
    } else {
        format!("Routes stopped (stopped:{})", stopped)
    };
    let mut out = vec![header];
    if level.per_route() {
        out.extend(lines.iter().map(SummaryLine::render));
    }
    out
}

pub fn log_summary(lines: &[String]) {
    for line in lines {
        info!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(status: &str, id: &str, cid: Option<&str>) -> SummaryLine {
        SummaryLine {
            status: status.to_owned(),
            id: id.to_owned(),
            uri: format!("direct://{}", id),
            configuration_id: cid.map(str::to_owned),
            detail: None,
        }
    }

    #[test]
    fn test_startup_summary_levels() {
        let lines = vec![line("Started", "a", Some("cfg")), line("Started", "b", None)];
        assert!(startup_summary(StartupSummaryLevel::Off, &lines).is_empty());
        assert_eq!(
            startup_summary(StartupSummaryLevel::Oneline, &lines),
            vec!["Routes startup (started:2)".to_owned()]
        );
        let default = startup_summary(StartupSummaryLevel::Default, &lines);
        assert_eq!(default.len(), 3);
        assert_eq!(default[1], "    Started a (direct://a)");
        let verbose = startup_summary(StartupSummaryLevel::Verbose, &lines);
        assert_eq!(verbose[3], "Routes configuration:");
        assert_eq!(verbose[4], "    a (cfg)");
        assert_eq!(verbose.len(), 5);
    }

    #[test]
    fn test_startup_summary_counts_disabled() {
        let lines = vec![line("Started", "a", None), line("Disabled", "b", None)];
        assert_eq!(
            startup_summary(StartupSummaryLevel::Oneline, &lines)[0],
            "Routes startup (total:2 started:1 disabled:1)"
        );
    }

    #[test]
    fn test_supervised_summary() {
        let lines = vec![
            line("Started", "a", None),
            line("Restarting", "b", None).with_detail("BackOff[delay=2s, multiplier=1]".to_owned()),
            line("Exhausted", "c", None),
        ];
        let summary = supervised_startup_summary(StartupSummaryLevel::Default, &lines);
        assert_eq!(
            summary[0],
            "Routes startup (total:3 started:1 restarting:1 exhausted:1)"
        );
        assert_eq!(
            summary[2],
            "    Restarting b (direct://b) with BackOff[delay=2s, multiplier=1]"
        );
    }

    #[test]
    fn test_stop_summary() {
        let lines = vec![line("Stopped", "a", None), line("Forced stopped", "b", None)];
        let summary = stop_summary(StartupSummaryLevel::Verbose, &lines);
        assert_eq!(summary[0], "Routes stopped (total:2 stopped:2 forced:1)");
        assert_eq!(summary[2], "    Forced stopped b (direct://b)");
        assert_eq!(summary.len(), 3);

        let graceful = vec![line("Stopped", "a", None)];
        assert_eq!(
            stop_summary(StartupSummaryLevel::Oneline, &graceful),
            vec!["Routes stopped (stopped:1)".to_owned()]
        );
    }
}

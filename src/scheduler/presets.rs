//! The closed set of schedule presets.
//!
//! Each preset pairs a cron expression with a maximum uniform random delay
//! applied per firing, so that many installs' automated runs spread
//! naturally through a window instead of landing on the same minute.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub label: &'static str,
    pub cron: &'static str,
    pub max_delay: Duration,
}

const THREE_HOURS: Duration = Duration::from_secs(3 * 60 * 60);

const PRESETS: [Preset; 9] = [
    Preset {
        label: "Daily (morning)",
        cron: "0 7 * * *",
        max_delay: THREE_HOURS,
    },
    Preset {
        label: "Daily (afternoon)",
        cron: "0 12 * * *",
        max_delay: THREE_HOURS,
    },
    Preset {
        label: "Daily (evening)",
        cron: "0 17 * * *",
        max_delay: THREE_HOURS,
    },
    Preset {
        label: "Weekdays (morning)",
        cron: "0 7 * * 1-5",
        max_delay: THREE_HOURS,
    },
    Preset {
        label: "Weekdays (afternoon)",
        cron: "0 12 * * 1-5",
        max_delay: THREE_HOURS,
    },
    Preset {
        label: "Weekdays (evening)",
        cron: "0 17 * * 1-5",
        max_delay: THREE_HOURS,
    },
    Preset {
        label: "Weekly (morning)",
        cron: "0 7 * * 1",
        max_delay: THREE_HOURS,
    },
    Preset {
        label: "Weekly (afternoon)",
        cron: "0 12 * * 1",
        max_delay: THREE_HOURS,
    },
    Preset {
        label: "Weekly (evening)",
        cron: "0 17 * * 1",
        max_delay: THREE_HOURS,
    },
];

pub fn presets() -> &'static [Preset] {
    &PRESETS
}

pub fn find_preset(label: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|preset| preset.label == label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::CronExpr;

    #[test]
    fn preset_table_matches_expected_expressions() {
        let expected = [
            ("Daily (morning)", "0 7 * * *"),
            ("Daily (afternoon)", "0 12 * * *"),
            ("Daily (evening)", "0 17 * * *"),
            ("Weekdays (morning)", "0 7 * * 1-5"),
            ("Weekdays (afternoon)", "0 12 * * 1-5"),
            ("Weekdays (evening)", "0 17 * * 1-5"),
            ("Weekly (morning)", "0 7 * * 1"),
            ("Weekly (afternoon)", "0 12 * * 1"),
            ("Weekly (evening)", "0 17 * * 1"),
        ];
        assert_eq!(presets().len(), expected.len());
        for (label, cron) in expected {
            let preset = find_preset(label).unwrap_or_else(|| panic!("missing preset {label}"));
            assert_eq!(preset.cron, cron);
            assert_eq!(preset.max_delay, THREE_HOURS);
        }
    }

    #[test]
    fn every_preset_expression_parses() {
        for preset in presets() {
            assert!(
                CronExpr::parse(preset.cron).is_ok(),
                "preset {} has unparseable cron",
                preset.label
            );
        }
    }

    #[test]
    fn unknown_label_is_none() {
        assert!(find_preset("Hourly").is_none());
    }
}

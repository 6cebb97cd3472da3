use once_cell::sync::Lazy;
use regex::Regex;

use super::{Fields, Plugin, PluginOptions};
use crate::util::bump;
use crate::zone::{Counters, Scratch};

/// Parses SpamAssassin spamd result lines (`spamd: result: Y 15 - ...`).
/// Spam scores accumulate in private scratch; a named timer (conventionally
/// `zone:rate:1h`) publishes `last_spam_rate`, the spam score volume seen
/// since the previous fire.
#[derive(Debug)]
pub struct SpamdPlugin {
    pattern: Regex,
}

static RESULT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"spamd: result: ([Y.]) (-?\d+(?:\.\d+)?) ").unwrap());

fn scratch_num(private: &Scratch, key: &str) -> f64 {
    private.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

fn set_scratch_num(private: &mut Scratch, key: &str, value: f64) {
    private.insert(key.to_string(), serde_json::json!(value));
}

impl SpamdPlugin {
    pub fn new(_options: &PluginOptions, pattern: Option<Regex>) -> Self {
        SpamdPlugin {
            pattern: pattern.unwrap_or_else(|| RESULT_RE.clone()),
        }
    }
}

impl Plugin for SpamdPlugin {
    fn name(&self) -> &'static str {
        "spamd"
    }

    fn init_zone(
        &self,
        _zone: &str,
        public: &mut Counters,
        private: &mut Scratch,
        window: &mut Counters,
    ) {
        for key in ["spam", "ham"] {
            public.entry(key.to_string()).or_insert(0.0);
            window.entry(key.to_string()).or_insert(0.0);
        }
        if !private.contains_key("spam_score_sum") {
            set_scratch_num(private, "spam_score_sum", 0.0);
        }
        if !private.contains_key("spam_score_mark") {
            set_scratch_num(private, "spam_score_mark", 0.0);
        }
    }

    fn process_line(&self, line: &str) -> Option<Fields> {
        let caps = self.pattern.captures(line)?;
        Some(vec![caps[1].to_string(), caps[2].to_string()])
    }

    fn process_data(
        &self,
        fields: &Fields,
        public: &mut Counters,
        private: &mut Scratch,
        window: &mut Counters,
    ) {
        let score: f64 = fields[1].parse().unwrap_or(0.0);
        if fields[0] == "Y" {
            bump(public, "spam", 1.0);
            bump(window, "spam", 1.0);
            let sum = scratch_num(private, "spam_score_sum") + score;
            set_scratch_num(private, "spam_score_sum", sum);
        } else {
            bump(public, "ham", 1.0);
            bump(window, "ham", 1.0);
        }
    }

    fn process_window(
        &self,
        _public: &mut Counters,
        private: &mut Scratch,
        windows: &mut [Counters],
    ) {
        // The just-completed window sits at index 0 during rollover.
        let spam = windows
            .first()
            .and_then(|w| w.get("spam"))
            .copied()
            .unwrap_or(0.0);
        set_scratch_num(private, "last_window_spam", spam);
    }

    fn process_timer(
        &self,
        name: &str,
        public: &mut Counters,
        private: &mut Scratch,
        _windows: &[Counters],
    ) -> bool {
        if name != "rate" {
            return false;
        }
        let sum = scratch_num(private, "spam_score_sum");
        let mark = scratch_num(private, "spam_score_mark");
        public.insert("last_spam_rate".to_string(), sum - mark);
        set_scratch_num(private, "spam_score_mark", sum);
        true
    }
}

use serde::{Deserialize, Serialize};

/// Token usage reported by the remote service for one run or completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Running totals across many runs or batched completions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub count: u32,
}

impl UsageTotals {
    pub fn accumulate(&mut self, usage: &RunUsage) {
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.total_tokens += u64::from(usage.total_tokens);
        self.count += 1;
    }
}

impl<'a> FromIterator<&'a RunUsage> for UsageTotals {
    fn from_iter<I: IntoIterator<Item = &'a RunUsage>>(iter: I) -> Self {
        let mut totals = Self::default();
        for usage in iter {
            totals.accumulate(usage);
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_sums_fields() {
        let usages = [
            RunUsage { prompt_tokens: 37, completion_tokens: 843, total_tokens: 880 },
            RunUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
        ];
        let totals: UsageTotals = usages.iter().collect();
        assert_eq!(totals.prompt_tokens, 47);
        assert_eq!(totals.completion_tokens, 848);
        assert_eq!(totals.total_tokens, 895);
        assert_eq!(totals.count, 2);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let usage: RunUsage = serde_json::from_str(r#"{"total_tokens": 12}"#).unwrap();
        assert_eq!(usage.prompt_tokens, 0);
        assert_eq!(usage.total_tokens, 12);
    }
}

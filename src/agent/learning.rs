use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// One recorded task outcome, used for approach recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub task_type:      String,
    pub success:        bool,
    pub execution_time: f64,
    pub quality_score:  Option<f64>,
    pub approach:       String,
    pub tools_used:     Vec<String>,
    pub error_type:     Option<String>,
    pub error_message:  Option<String>,
    pub recorded_at:    DateTime<Utc>,
}

/// Recommendation derived from past experiences of one task type.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub approach:     String,
    pub success_rate: f64,
    /// `success_rate × min(1, samples/5)` — low-sample approaches are
    /// discounted.
    pub confidence:   f64,
    pub sample_count: usize,
}

/// Aggregate view over everything the agent has recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningInsights {
    pub total_experiences: usize,
    pub overall_success_rate: f64,
    pub by_task_type: HashMap<String, TaskTypeInsight>,
    pub common_errors: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTypeInsight {
    pub count:              usize,
    pub success_rate:       f64,
    pub avg_execution_time: f64,
}

/// Hints produced by [`LearningStore::adapt_strategy`].
#[derive(Debug, Clone, Default)]
pub struct StrategyAdjustment {
    pub preferred_approach: Option<String>,
    /// Set when timeouts dominate recent failures for the task type.
    pub increase_timeout:   bool,
    /// Set when the recent failure rate crosses one half.
    pub increase_retries:   bool,
}

/// Append-only per-agent experience store.
pub struct LearningStore {
    experiences: Mutex<Vec<Experience>>,
}

impl LearningStore {
    pub fn new() -> Self {
        Self {
            experiences: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, experience: Experience) {
        self.experiences
            .lock()
            .expect("experience lock poisoned")
            .push(experience);
    }

    pub fn len(&self) -> usize {
        self.experiences.lock().expect("experience lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best approach for a task type: highest success rate, ties broken by
    /// lower mean execution time.
    pub fn recommended_approach(&self, task_type: &str) -> Option<Recommendation> {
        let experiences = self.experiences.lock().expect("experience lock poisoned");
        let mut by_approach: HashMap<&str, (usize, usize, f64)> = HashMap::new();
        for exp in experiences.iter().filter(|e| e.task_type == task_type) {
            let entry = by_approach.entry(exp.approach.as_str()).or_insert((0, 0, 0.0));
            entry.0 += 1;
            if exp.success {
                entry.1 += 1;
            }
            entry.2 += exp.execution_time;
        }

        by_approach
            .into_iter()
            .map(|(approach, (count, successes, total_time))| {
                let success_rate = successes as f64 / count as f64;
                let mean_time = total_time / count as f64;
                (approach.to_string(), success_rate, mean_time, count)
            })
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Lower mean time wins a success-rate tie.
                    .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
            })
            .map(|(approach, success_rate, _, count)| Recommendation {
                approach,
                success_rate,
                confidence: success_rate * (count as f64 / 5.0).min(1.0),
                sample_count: count,
            })
    }

    pub fn insights(&self) -> LearningInsights {
        let experiences = self.experiences.lock().expect("experience lock poisoned");
        if experiences.is_empty() {
            return LearningInsights::default();
        }

        let total = experiences.len();
        let successes = experiences.iter().filter(|e| e.success).count();

        let mut by_task_type: HashMap<String, (usize, usize, f64)> = HashMap::new();
        let mut errors: HashMap<String, usize> = HashMap::new();
        for exp in experiences.iter() {
            let entry = by_task_type.entry(exp.task_type.clone()).or_insert((0, 0, 0.0));
            entry.0 += 1;
            if exp.success {
                entry.1 += 1;
            }
            entry.2 += exp.execution_time;
            if let Some(error_type) = &exp.error_type {
                *errors.entry(error_type.clone()).or_insert(0) += 1;
            }
        }

        let mut common_errors: Vec<(String, usize)> = errors.into_iter().collect();
        common_errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        LearningInsights {
            total_experiences: total,
            overall_success_rate: successes as f64 / total as f64,
            by_task_type: by_task_type
                .into_iter()
                .map(|(task_type, (count, ok, time))| {
                    (
                        task_type,
                        TaskTypeInsight {
                            count,
                            success_rate:       ok as f64 / count as f64,
                            avg_execution_time: time / count as f64,
                        },
                    )
                })
                .collect(),
            common_errors,
        }
    }

    /// Derive adjustments from recent history of one task type.
    pub fn adapt_strategy(&self, task_type: &str) -> StrategyAdjustment {
        let recommendation = self.recommended_approach(task_type);
        let experiences = self.experiences.lock().expect("experience lock poisoned");
        let recent: Vec<&Experience> = experiences
            .iter()
            .filter(|e| e.task_type == task_type)
            .rev()
            .take(10)
            .collect();

        if recent.is_empty() {
            return StrategyAdjustment::default();
        }

        let failures = recent.iter().filter(|e| !e.success).count();
        let timeouts = recent
            .iter()
            .filter(|e| e.error_type.as_deref() == Some("TIMEOUT_ERROR"))
            .count();

        StrategyAdjustment {
            preferred_approach: recommendation.map(|r| r.approach),
            increase_timeout:   timeouts * 2 > failures.max(1),
            increase_retries:   failures * 2 > recent.len(),
        }
    }
}

impl Default for LearningStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exp(task_type: &str, approach: &str, success: bool, time: f64) -> Experience {
        Experience {
            task_type:      task_type.to_string(),
            success,
            execution_time: time,
            quality_score:  None,
            approach:       approach.to_string(),
            tools_used:     vec![],
            error_type:     if success { None } else { Some("EXECUTION_ERROR".into()) },
            error_message:  None,
            recorded_at:    Utc::now(),
        }
    }

    #[test]
    fn recommends_highest_success_rate() {
        let store = LearningStore::new();
        store.record(exp("research", "llm_loop", true, 2.0));
        store.record(exp("research", "llm_loop", true, 2.0));
        store.record(exp("research", "direct", false, 1.0));
        store.record(exp("research", "direct", true, 1.0));

        let rec = store.recommended_approach("research").unwrap();
        assert_eq!(rec.approach, "llm_loop");
        assert_eq!(rec.success_rate, 1.0);
    }

    #[test]
    fn ties_break_on_lower_mean_time() {
        let store = LearningStore::new();
        store.record(exp("calc", "slow", true, 10.0));
        store.record(exp("calc", "fast", true, 1.0));

        let rec = store.recommended_approach("calc").unwrap();
        assert_eq!(rec.approach, "fast");
    }

    #[test]
    fn confidence_discounts_small_samples() {
        let store = LearningStore::new();
        store.record(exp("x", "a", true, 1.0));
        let rec = store.recommended_approach("x").unwrap();
        // One sample of five: confidence is a fifth of the success rate.
        assert!((rec.confidence - 0.2).abs() < 1e-9);

        for _ in 0..4 {
            store.record(exp("x", "a", true, 1.0));
        }
        let rec = store.recommended_approach("x").unwrap();
        assert!((rec.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_task_type_has_no_recommendation() {
        let store = LearningStore::new();
        assert!(store.recommended_approach("nope").is_none());
    }

    #[test]
    fn insights_aggregate_by_task_type() {
        let store = LearningStore::new();
        store.record(exp("a", "x", true, 2.0));
        store.record(exp("a", "x", false, 4.0));
        store.record(exp("b", "y", true, 1.0));

        let insights = store.insights();
        assert_eq!(insights.total_experiences, 3);
        assert!((insights.overall_success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(insights.by_task_type["a"].count, 2);
        assert!((insights.by_task_type["a"].avg_execution_time - 3.0).abs() < 1e-9);
        assert_eq!(insights.common_errors[0].0, "EXECUTION_ERROR");
    }

    #[test]
    fn adapt_strategy_flags_failures() {
        let store = LearningStore::new();
        for _ in 0..6 {
            store.record(exp("flaky", "a", false, 1.0));
        }
        for _ in 0..2 {
            store.record(exp("flaky", "a", true, 1.0));
        }
        let adjustment = store.adapt_strategy("flaky");
        assert!(adjustment.increase_retries);
        assert_eq!(adjustment.preferred_approach.as_deref(), Some("a"));
    }
}

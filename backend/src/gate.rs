use cxr_shared::{Prediction, ReportEligibility, Severity};

use crate::config::{GateConfig, LabelConfig};

/// True iff the prediction names the positive label and its score for that
/// label reaches the threshold.
pub fn is_report_eligible(prediction: &Prediction, threshold: f32, positive_label: &str) -> bool {
    prediction.label == positive_label
        && prediction
            .score(positive_label)
            .is_some_and(|score| score >= threshold)
}

#[derive(Debug, Clone)]
pub struct DecisionGate {
    threshold: f32,
    positive_label: String,
}

/// A prediction that passed the gate. Only `DecisionGate::admit` builds one,
/// so report generation cannot be invoked on an ineligible prediction.
#[derive(Debug, Clone)]
pub struct EligiblePrediction {
    prediction: Prediction,
    eligibility: ReportEligibility,
}

impl EligiblePrediction {
    pub fn prediction(&self) -> &Prediction {
        &self.prediction
    }

    pub fn eligibility(&self) -> &ReportEligibility {
        &self.eligibility
    }

    pub fn into_parts(self) -> (Prediction, ReportEligibility) {
        (self.prediction, self.eligibility)
    }
}

impl DecisionGate {
    pub fn new(threshold: f32, positive_label: impl Into<String>) -> Self {
        Self {
            threshold,
            positive_label: positive_label.into(),
        }
    }

    pub fn from_config(gate: &GateConfig, labels: &LabelConfig) -> Self {
        Self::new(gate.threshold, labels.positive.clone())
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn evaluate(&self, prediction: &Prediction) -> ReportEligibility {
        ReportEligibility {
            eligible: is_report_eligible(prediction, self.threshold, &self.positive_label),
            threshold: self.threshold,
            positive_label: self.positive_label.clone(),
        }
    }

    /// Triage grade, independent of the reporting threshold.
    pub fn severity(&self, prediction: &Prediction) -> Severity {
        Severity::grade(prediction.label == self.positive_label, prediction.confidence)
    }

    pub fn admit(&self, prediction: &Prediction) -> Option<EligiblePrediction> {
        let eligibility = self.evaluate(prediction);
        eligibility.eligible.then(|| EligiblePrediction {
            prediction: prediction.clone(),
            eligibility,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn prediction(label: &str, positive: f32) -> Prediction {
        Prediction {
            label: label.to_string(),
            confidence: if label == "Positive" { positive } else { 1.0 - positive },
            scores: BTreeMap::from([
                ("Positive".to_string(), positive),
                ("Negative".to_string(), 1.0 - positive),
            ]),
            saliency: None,
            engine: "test".to_string(),
        }
    }

    #[test]
    fn positive_above_threshold_is_eligible() {
        assert!(is_report_eligible(&prediction("Positive", 0.92), 0.8, "Positive"));
    }

    #[test]
    fn threshold_is_inclusive() {
        assert!(is_report_eligible(&prediction("Positive", 0.8), 0.8, "Positive"));
        assert!(!is_report_eligible(&prediction("Positive", 0.79), 0.8, "Positive"));
    }

    #[test]
    fn negative_label_is_never_eligible() {
        assert!(!is_report_eligible(&prediction("Negative", 0.09), 0.8, "Positive"));
        assert!(!is_report_eligible(&prediction("Negative", 0.09), 0.0, "Positive"));
    }

    #[test]
    fn missing_score_is_not_eligible() {
        let mut p = prediction("Positive", 0.95);
        p.scores.clear();
        assert!(!is_report_eligible(&p, 0.5, "Positive"));
    }

    #[test]
    fn threshold_varies_without_code_changes() {
        let p = prediction("Positive", 0.7);
        assert!(DecisionGate::new(0.6, "Positive").admit(&p).is_some());
        assert!(DecisionGate::new(0.75, "Positive").admit(&p).is_none());
    }

    #[test]
    fn evaluation_is_repeatable() {
        let gate = DecisionGate::new(0.8, "Positive");
        let p = prediction("Positive", 0.85);
        let first = gate.evaluate(&p);
        assert_eq!(first, gate.evaluate(&p));
        assert!(first.eligible);
        assert_eq!(first.positive_label, "Positive");
    }

    #[test]
    fn severity_ignores_the_reporting_threshold() {
        let gate = DecisionGate::new(0.95, "Positive");
        assert_eq!(gate.severity(&prediction("Positive", 0.92)), Severity::High);
        assert_eq!(gate.severity(&prediction("Positive", 0.85)), Severity::Moderate);
        assert_eq!(gate.severity(&prediction("Positive", 0.6)), Severity::Mild);
        assert_eq!(gate.severity(&prediction("Negative", 0.05)), Severity::None);
    }
}

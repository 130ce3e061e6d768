//! Built-in metric functions over a full evaluation split

use crate::training::evaluator::EvalPrediction;
use crate::training::MetricsRecord;
use anyhow::{ensure, Result};

/// Per-class confusion counts
struct ClassCounts {
    true_positives: Vec<f64>,
    predicted: Vec<f64>,
    actual: Vec<f64>,
}

impl ClassCounts {
    fn from_eval(eval: &EvalPrediction) -> Result<(Self, f64)> {
        let predictions = eval.argmax()?;
        ensure!(
            predictions.len() == eval.label_ids.len(),
            "{} predictions for {} labels",
            predictions.len(),
            eval.label_ids.len()
        );
        ensure!(!predictions.is_empty(), "evaluation split is empty");

        let num_classes = predictions
            .iter()
            .chain(&eval.label_ids)
            .copied()
            .max()
            .unwrap_or(0)
            .max(0) as usize
            + 1;
        ensure!(
            eval.label_ids.iter().all(|&l| l >= 0),
            "negative class label"
        );

        let mut counts = Self {
            true_positives: vec![0.0; num_classes],
            predicted: vec![0.0; num_classes],
            actual: vec![0.0; num_classes],
        };
        let mut correct = 0.0;
        for (&pred, &label) in predictions.iter().zip(&eval.label_ids) {
            counts.predicted[pred as usize] += 1.0;
            counts.actual[label as usize] += 1.0;
            if pred == label {
                counts.true_positives[label as usize] += 1.0;
                correct += 1.0;
            }
        }

        Ok((counts, correct / predictions.len() as f64))
    }

    /// Macro-averaged precision, recall and F1 over classes seen in either labels or predictions
    fn macro_scores(&self) -> (f64, f64, f64) {
        let mut precision = 0.0;
        let mut recall = 0.0;
        let mut f1 = 0.0;
        let mut classes = 0.0;

        for c in 0..self.actual.len() {
            if self.actual[c] == 0.0 && self.predicted[c] == 0.0 {
                continue;
            }
            let p = safe_div(self.true_positives[c], self.predicted[c]);
            let r = safe_div(self.true_positives[c], self.actual[c]);
            precision += p;
            recall += r;
            f1 += safe_div(2.0 * p * r, p + r);
            classes += 1.0;
        }

        (
            safe_div(precision, classes),
            safe_div(recall, classes),
            safe_div(f1, classes),
        )
    }
}

fn safe_div(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Compute accuracy
pub fn accuracy(eval: &EvalPrediction) -> Result<MetricsRecord> {
    let (_, accuracy) = ClassCounts::from_eval(eval)?;
    let mut record = MetricsRecord::new();
    record.insert("accuracy", accuracy);
    Ok(record)
}

/// Compute macro-averaged F1
pub fn macro_f1(eval: &EvalPrediction) -> Result<MetricsRecord> {
    let (counts, _) = ClassCounts::from_eval(eval)?;
    let (_, _, f1) = counts.macro_scores();
    let mut record = MetricsRecord::new();
    record.insert("f1", f1);
    Ok(record)
}

/// Accuracy with macro precision, recall and F1
pub fn classification_metrics(eval: &EvalPrediction) -> Result<MetricsRecord> {
    let (counts, accuracy) = ClassCounts::from_eval(eval)?;
    let (precision, recall, f1) = counts.macro_scores();

    let mut record = MetricsRecord::new();
    record.insert("accuracy", accuracy);
    record.insert("precision", precision);
    record.insert("recall", recall);
    record.insert("f1", f1);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::state::HostTensor;

    /// One-hot logits for the given predicted classes
    fn eval(predicted: &[i64], labels: &[i64], num_classes: usize) -> EvalPrediction {
        let mut values = vec![0.0; predicted.len() * num_classes];
        for (i, &p) in predicted.iter().enumerate() {
            values[i * num_classes + p as usize] = 1.0;
        }
        EvalPrediction {
            predictions: HostTensor::new(vec![predicted.len(), num_classes], values).unwrap(),
            label_ids: labels.to_vec(),
        }
    }

    #[test]
    fn test_metrics() {
        let eval = eval(&[1, 0, 1, 0, 1], &[1, 0, 0, 0, 1], 2);

        let acc = accuracy(&eval).unwrap();
        assert_eq!(acc.get("accuracy"), Some(0.8)); // 4 out of 5 correct

        let all = classification_metrics(&eval).unwrap();
        // class 0: p = 2/2, r = 2/3; class 1: p = 2/3, r = 2/2
        assert!((all.get("precision").unwrap() - 5.0 / 6.0).abs() < 1e-12);
        assert!((all.get("recall").unwrap() - 5.0 / 6.0).abs() < 1e-12);
        assert!((all.get("f1").unwrap() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_macro_f1_is_global() {
        // per-batch averaging would give a different answer than the whole split
        let eval = eval(&[0, 0, 1, 2], &[0, 1, 1, 2], 3);
        let f1 = macro_f1(&eval).unwrap().get("f1").unwrap();
        // class 0: 2/3, class 1: 2/3, class 2: 1
        assert!((f1 - (2.0 / 3.0 + 2.0 / 3.0 + 1.0) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let mut eval = eval(&[0, 1], &[0, 1], 2);
        eval.label_ids.push(1);
        assert!(accuracy(&eval).is_err());
    }
}

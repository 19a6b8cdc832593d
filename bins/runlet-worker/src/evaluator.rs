/// Test Evaluator - Output Comparison for Test Jobs
///
/// **Core Responsibility:**
/// Decide whether an execution outcome satisfies a test's expected outputs.
///
/// **Critical Properties:**
/// - Knows nothing about engines
/// - Knows nothing about Redis
/// - Pure function: (execution outcome, expected outputs) → verdict
///
/// **Rules:**
/// - Any reported error fails the test before outputs are compared
/// - Outputs are compared line by line and by count
///
/// **Normalization Rules (applied to every line):**
/// - `\r\n` becomes `\n`
/// - Leading and trailing whitespace is trimmed
/// - Case and interior content must match exactly

use runlet_common::types::{ExecutionOutcome, ResultStatus};

pub const OUTPUT_MISMATCH: &str = "Output mismatch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    /// The execution reported errors; outputs were not compared.
    Errored { errors: Vec<String> },
    Mismatch { expected: usize, actual: usize },
}

impl Verdict {
    pub fn status(&self) -> ResultStatus {
        match self {
            Verdict::Passed => ResultStatus::Passed,
            _ => ResultStatus::Failed,
        }
    }
}

/// Normalize one output line for comparison.
fn normalize_line(line: &str) -> String {
    line.replace("\r\n", "\n").trim().to_string()
}

pub fn outputs_match(actual: &[String], expected: &[String]) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected)
            .all(|(a, e)| normalize_line(a) == normalize_line(e))
}

pub fn evaluate(outcome: &ExecutionOutcome, expected: &[String]) -> Verdict {
    if !outcome.errors.is_empty() {
        return Verdict::Errored {
            errors: outcome.errors.clone(),
        };
    }

    if outputs_match(&outcome.outputs, expected) {
        Verdict::Passed
    } else {
        Verdict::Mismatch {
            expected: expected.len(),
            actual: outcome.outputs.len(),
        }
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! ASCII rendering of run results for the CLI.

use fedclust_core::MembershipMatrix;
use fedclust_neural::RoundRecord;
use std::fmt::Write;

/// Render the membership matrix, `#` where two clients aggregate together
pub fn render_membership(membership: &MembershipMatrix) -> String {
    let n = membership.n();
    let mut output = String::new();

    // Column labels use the last digit of the client id
    output.push_str("    ");
    for col in 0..n {
        let _ = write!(output, " {}", col % 10);
    }
    output.push('\n');

    for row in 0..n {
        let _ = write!(output, "{:3} ", row);
        for col in 0..n {
            let symbol = if membership.get(row, col) { '#' } else { '.' };
            let _ = write!(output, " {}", symbol);
        }
        output.push('\n');
    }
    output
}

/// One line per round: loss, accuracies and whether clusters changed
pub fn render_history(history: &[RoundRecord]) -> String {
    let mut output = String::from("round  train_loss  train_acc  test_acc  recluster\n");
    for record in history {
        let (train, test) = match &record.evaluation {
            Some(eval) => (
                format!("{:.4}", eval.train_accuracy),
                format!("{:.4}", eval.test_accuracy),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        let _ = writeln!(
            output,
            "{:5}  {:10.4}  {:>9}  {:>8}  {}",
            record.round,
            record.mean_train_loss,
            train,
            test,
            if record.reclustered { "yes" } else { "" }
        );
    }
    output
}

//! Markdown rendering of an [`AnalysisSummary`].

use super::{AccuracyRow, AnalysisSummary, BreakdownRow, NotableExample, PairComparison};

fn pct(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

fn opt_pct(value: Option<f64>) -> String {
    value.map(pct).unwrap_or_else(|| "n/a".to_string())
}

fn accuracy_table(out: &mut String, title: &str, rows: &[AccuracyRow]) {
    if rows.is_empty() {
        return;
    }
    out.push_str(&format!("\n### {title}\n\n"));
    out.push_str("| Predictor | Correct | Total | Accuracy |\n");
    out.push_str("|---|---:|---:|---:|\n");
    for row in rows {
        out.push_str(&format!(
            "| {} | {} | {} | {:.1}% |\n",
            row.name, row.correct, row.total, row.percentage
        ));
    }
}

/// Comparison table shared by `analyze` and `compare`.
pub fn render_comparisons(out: &mut String, comparisons: &[PairComparison]) {
    if comparisons.is_empty() {
        out.push_str("No paired predictors.\n");
        return;
    }
    out.push_str("| First | Second | n | First acc | Second acc | b/c | p-value | Δ (95% CI) | |\n");
    out.push_str("|---|---|---:|---:|---:|---:|---:|---|---|\n");
    for cmp in comparisons {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {}/{} | {:.4} | {:+.3} [{:+.3}, {:+.3}] | {} |\n",
            cmp.first,
            cmp.second,
            cmp.questions,
            pct(cmp.first_accuracy),
            pct(cmp.second_accuracy),
            cmp.mcnemar.b,
            cmp.mcnemar.c,
            cmp.mcnemar.p_value,
            cmp.bootstrap.mean_delta,
            cmp.bootstrap.ci_low,
            cmp.bootstrap.ci_high,
            if cmp.significant { "**significant**" } else { "" },
        ));
    }
}

fn breakdown_table(out: &mut String, title: &str, rows: &[BreakdownRow]) {
    if rows.is_empty() {
        return;
    }
    out.push_str(&format!("\n### {title}\n\n"));
    out.push_str("| Group | Questions | Best model | Best model acc | Strategy acc | Lift |\n");
    out.push_str("|---|---:|---|---:|---:|---:|\n");
    for row in rows {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            row.group,
            row.questions,
            row.best_model.as_deref().unwrap_or("-"),
            pct(row.best_model_accuracy),
            opt_pct(row.strategy_accuracy),
            row.lift
                .map(|l| format!("{:+.1} pts", l * 100.0))
                .unwrap_or_else(|| "n/a".to_string()),
        ));
    }
}

fn example_list(out: &mut String, title: &str, examples: &[NotableExample]) {
    out.push_str(&format!("\n### {title}\n\n"));
    if examples.is_empty() {
        out.push_str("None.\n");
        return;
    }
    for ex in examples {
        out.push_str(&format!(
            "- `{}` ({}/{} models correct, expected `{}`, strategy `{}`): {}\n",
            ex.question_id,
            ex.models_correct,
            ex.models_total,
            ex.expected,
            ex.strategy_prediction.as_deref().unwrap_or("-"),
            ex.prompt
        ));
    }
}

pub fn render_markdown(summary: &AnalysisSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Ensemble Analysis: {}\n\n", summary.dataset));
    out.push_str(&format!("- Mode: {}\n", summary.mode));
    out.push_str(&format!(
        "- Questions: {} ({} evaluated)\n",
        summary.total_questions, summary.evaluated_questions
    ));

    out.push_str("\n## Accuracy\n");
    accuracy_table(&mut out, "Models", &summary.model_accuracy);
    accuracy_table(&mut out, "Strategies", &summary.strategy_accuracy);
    accuracy_table(&mut out, "Self-consistency", &summary.self_consistency);

    out.push_str("\n## Significance\n\n");
    render_comparisons(&mut out, &summary.comparisons);

    out.push_str("\n## Calibration\n\n");
    if summary.calibration.is_empty() {
        out.push_str("No predictions to bucket.\n");
    } else {
        out.push_str("| Agreement | Questions | Model acc | Modal answer acc | Strategy acc |\n");
        out.push_str("|---|---:|---:|---:|---:|\n");
        for bucket in &summary.calibration {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                bucket.bucket,
                bucket.questions,
                pct(bucket.model_accuracy),
                pct(bucket.modal_accuracy),
                opt_pct(bucket.strategy_accuracy)
            ));
        }
    }

    if let Some(ra) = &summary.right_answer {
        out.push_str(&format!("\n### Right answer present ({})\n\n", ra.strategy));
        out.push_str(&format!(
            "- Questions with at least one correct model: {}\n",
            ra.questions_with_correct_model
        ));
        out.push_str(&format!("- Recovered by strategy: {}\n", ra.recovered));
        out.push_str(&format!("- Missed by strategy: {}\n", ra.missed));
        out.push_str(&format!("- Correct only via strategy: {}\n", ra.ensemble_only));
    }

    let heat = &summary.diversity;
    if heat.models.len() > 1 {
        out.push_str("\n### Answer agreement\n\n");
        out.push_str(&format!("| | {} |\n", heat.models.join(" | ")));
        out.push_str(&format!("|---|{}\n", "---:|".repeat(heat.models.len())));
        for (model, row) in heat.models.iter().zip(&heat.agreement) {
            let cells: Vec<String> = row
                .iter()
                .map(|v| v.map(|x| format!("{x:.2}")).unwrap_or_else(|| "-".to_string()))
                .collect();
            out.push_str(&format!("| {} | {} |\n", model, cells.join(" | ")));
        }
    }

    out.push_str("\n## Breakdowns\n");
    if summary.category_breakdown.is_empty() && summary.difficulty_breakdown.is_empty() {
        out.push_str("\nNo category or difficulty labels.\n");
    }
    breakdown_table(&mut out, "By category", &summary.category_breakdown);
    breakdown_table(&mut out, "By difficulty", &summary.difficulty_breakdown);

    out.push_str("\n## Notable Examples\n");
    match &summary.notable_examples.strategy {
        Some(strategy) => {
            example_list(
                &mut out,
                &format!("{strategy} right, most models wrong"),
                &summary.notable_examples.strategy_wins,
            );
            example_list(
                &mut out,
                &format!("{strategy} wrong, most models right"),
                &summary.notable_examples.strategy_losses,
            );
        }
        None => out.push_str("\nNo strategy results.\n"),
    }

    out.push_str("\n## Cost\n\n");
    out.push_str("| Item | Questions | Tokens | Cost (USD) | Avg tokens/q | Avg cost/q |\n");
    out.push_str("|---|---:|---:|---:|---:|---:|\n");
    for row in summary.cost.models.iter().chain(&summary.cost.strategies) {
        out.push_str(&format!(
            "| {} | {} | {} | ${:.4} | {:.0} | ${:.5} |\n",
            row.name,
            row.questions,
            row.total_tokens,
            row.cost_usd,
            row.avg_tokens_per_question,
            row.avg_cost_per_question
        ));
    }
    out.push_str(&format!("\nTotal: ${:.4}\n", summary.cost.total_usd));

    out
}

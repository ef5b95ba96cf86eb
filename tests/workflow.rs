//! Classify, correct, re-optimize and inspect against an offline model.

use intent_tuner::example::LabelSet;
use intent_tuner::inspector::DiffKind;
use intent_tuner::lm::{CompletionRequest, FnModel, ModelPair};
use intent_tuner::repository::BASE_PROGRAM;
use intent_tuner::session::Session;
use tempfile::TempDir;

fn labels() -> LabelSet {
    LabelSet::new(["card_arrival", "card_swallowed", "lost_or_stolen_card"])
}

/// Says `card_arrival` unless the prompt mentions ATMs, in which case machines that keep cards are understood.
fn reply(request: &CompletionRequest) -> intent_tuner::Result<String> {
    if request.user.starts_with("text: ") {
        let text = request.user.to_lowercase();
        let label = if request.system.contains("ATM") && text.contains("atm") {
            "card_swallowed"
        } else {
            "card_arrival"
        };
        return Ok(format!("{{\"reasoning\": \"looked at the message\", \"label\": \"{}\"}}", label));
    }
    Ok("Pay attention to whether an ATM kept the card.\n2. Classify the intent.".to_string())
}

fn session(tmp: &TempDir, model: &FnModel) -> Session {
    Session::new(
        labels(),
        ModelPair::student_only(model.clone().shared()),
        tmp.path().join("programs"),
        tmp.path().join("feedback"),
    )
    .unwrap()
}

#[tokio::test]
async fn feedback_loop_produces_a_better_program() {
    let tmp = TempDir::new().unwrap();
    let model = FnModel::new("offline", reply);
    let mut session = session(&tmp, &model);

    let prediction = session.classify("The ATM kept my card").await.unwrap().unwrap();
    assert_eq!("card_arrival", prediction.label);
    assert!(session.labels().contains(&prediction.label));

    session
        .submit_feedback("The ATM kept my card", Some(&prediction.label), "card_swallowed", Some("the machine kept it"))
        .unwrap();
    session.submit_feedback("An ATM swallowed my debit card", None, "card_swallowed", None).unwrap();
    session.submit_feedback("My new card has not arrived", None, "card_arrival", None).unwrap();
    session.submit_feedback("Still waiting on my card", None, "card_arrival", None).unwrap();

    let outcome = session.optimize_feedback(20, 2).await.unwrap();
    let name = outcome.saved_as.expect("a program is saved");
    assert!(outcome.report.best_score > outcome.report.baseline_score);
    assert_eq!(1.0, outcome.report.best_score);
    assert_eq!(name, session.selected_name());

    let prediction = session.classify("The ATM kept my card").await.unwrap().unwrap();
    assert_eq!("card_swallowed", prediction.label);

    // a new session sees the saved program and the recorded feedback
    let mut reopened = self::session(&tmp, &model);
    assert_eq!(4, reopened.feedback().count());
    assert!(reopened.program_names().any(|n| n == name));
    assert!(reopened.program_names().any(|n| n == BASE_PROGRAM));
    reopened.select(&name).unwrap();
    assert_eq!(session.inspect(&name).unwrap(), reopened.inspect(&name).unwrap());

    let diff = reopened.compare(BASE_PROGRAM, &name).unwrap();
    assert!(diff
        .rows
        .iter()
        .any(|row| row.kind != DiffKind::Equal && row.right.as_deref().map_or(false, |r| r.contains("ATM"))));
}

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intent_tuner::config::AppConfig;
use intent_tuner::dataset::HuggingFaceCorpus;
use intent_tuner::example::Prediction;
use intent_tuner::feedback::{DEFAULT_FEEDBACK_MAX_DEMOS, DEFAULT_FEEDBACK_TRIALS};
use intent_tuner::inspector::token_count;
use intent_tuner::optimizer::FullRunParams;
use intent_tuner::repository::BASE_PROGRAM;
use intent_tuner::session::{OptimizationOutcome, Session};
use intent_tuner::utils::printing::MarkdownPrinter;
use intent_tuner::utils::token::tiktoken::Tiktoken;
use log::{error, warn};

#[derive(Parser)]
#[command(name = "intent-tuner")]
#[command(about = "Classify banking queries, collect corrections and optimize the classifier's prompt")]
#[command(version)]
struct Cli {
    /// Directory of saved programs
    #[arg(long, global = true, env = "PROGRAM_DIR", default_value = "programs")]
    program_dir: PathBuf,

    /// Directory of feedback records
    #[arg(long, global = true, env = "FEEDBACK_DIR", default_value = "feedback")]
    feedback_dir: PathBuf,

    /// Program to use
    #[arg(short, long, global = true, default_value = BASE_PROGRAM)]
    program: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify a customer query, then optionally correct the prediction
    Classify {
        /// The query. Read from stdin when omitted
        text: Vec<String>,

        /// Record this label as the correct one without asking
        #[arg(long)]
        correct_label: Option<String>,

        /// Why the prediction was wrong, recorded with the correction
        #[arg(long)]
        reasoning: Option<String>,

        /// Do not ask for feedback
        #[arg(long)]
        no_feedback: bool,
    },
    /// Manage collected feedback
    Feedback {
        #[command(subcommand)]
        action: FeedbackAction,
    },
    /// Optimize a program on the labeled corpus
    Optimize {
        #[arg(long, default_value_t = 10)]
        trials: usize,

        #[arg(long, default_value_t = 3)]
        max_bootstrapped_demos: usize,

        #[arg(long, default_value_t = 5)]
        max_labeled_demos: usize,
    },
    /// Optimize a program on the collected feedback
    OptimizeFeedback {
        #[arg(long, default_value_t = DEFAULT_FEEDBACK_TRIALS)]
        trials: usize,

        #[arg(long, default_value_t = DEFAULT_FEEDBACK_MAX_DEMOS)]
        max_demos: usize,
    },
    /// List saved programs
    Programs,
    /// List the intent labels
    Labels,
    /// Show what a program tells the model
    Inspect {
        /// Defaults to the selected program
        name: Option<String>,
    },
    /// Compare two programs line by line
    Compare {
        a: String,
        b: String,

        /// One column with +/- markers instead of two columns
        #[arg(long)]
        inline: bool,
    },
}

#[derive(Subcommand)]
enum FeedbackAction {
    /// Record a correction
    Add {
        text: String,

        /// The correct label
        #[arg(long)]
        label: String,

        /// The label the classifier gave
        #[arg(long)]
        predicted: Option<String>,

        #[arg(long)]
        reasoning: Option<String>,
    },
    /// Number of collected corrections
    Count,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
                record.target(),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env().context("Failed to initialize Language Model")?;
    config.program_dir = cli.program_dir.clone();
    config.feedback_dir = cli.feedback_dir.clone();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let mut session = Session::start(&config).await?;
    if let Err(e) = session.select(&cli.program) {
        if !e.is_not_found() {
            return Err(e.into());
        }
        warn!("Program '{}' not found, using '{}'", cli.program, session.selected_name());
    }
    let printer = MarkdownPrinter::default();

    match cli.command {
        Command::Classify { text, correct_label, reasoning, no_feedback } => {
            let text = if text.is_empty() {
                prompt_line("Enter a customer query to classify: ")?
            } else {
                text.join(" ")
            };
            let Some(prediction) = session.classify(&text).await.context("Classification failed")? else {
                return Ok(());
            };
            printer.print(&format!("**Query:** \"{}\"\n", text.trim()))?;
            printer.print_prediction(&prediction)?;
            match correct_label {
                Some(label) => submit(&mut session, &text, &prediction, &label, reasoning.as_deref())?,
                None if !no_feedback && io::stdin().is_terminal() => ask_feedback(&mut session, &text, &prediction)?,
                None => {}
            }
        }
        Command::Feedback { action: FeedbackAction::Add { text, label, predicted, reasoning } } => {
            session.submit_feedback(&text, predicted.as_deref(), &label, reasoning.as_deref())?;
            printer.print(&format!("Feedback collected: **{}**\n", session.feedback().count()))?;
        }
        Command::Feedback { action: FeedbackAction::Count } => {
            printer.print(&format!("Feedback collected: **{}**\n", session.feedback().count()))?;
        }
        Command::Optimize { trials, max_bootstrapped_demos, max_labeled_demos } => {
            let corpus = HuggingFaceCorpus::banking77(config.dataset_api_base.clone());
            let params = FullRunParams { num_trials: trials, max_bootstrapped_demos, max_labeled_demos };
            let program = session.selected_name().to_string();
            let outcome = session
                .optimize_full(&program, &corpus, params)
                .await
                .context("Optimization failed")?;
            report(&printer, &outcome)?;
        }
        Command::OptimizeFeedback { trials, max_demos } => {
            if session.feedback().count() == 0 {
                printer.print("No feedback collected yet. Classify some queries and correct the predictions first.\n")?;
                return Ok(());
            }
            let outcome = session
                .optimize_feedback(trials, max_demos)
                .await
                .context("Feedback optimization failed")?;
            report(&printer, &outcome)?;
        }
        Command::Programs => {
            let mut markdown = String::from("**Programs**\n");
            for name in session.program_names() {
                let marker = if name == session.selected_name() { " *(selected)*" } else { "" };
                markdown.push_str(&format!("* `{}`{}\n", name, marker));
            }
            printer.print(&markdown)?;
        }
        Command::Labels => {
            let labels: Vec<&str> = session.labels().iter().collect();
            println!("{}", labels.join("\n"));
        }
        Command::Inspect { name } => {
            let name = name.unwrap_or_else(|| session.selected_name().to_string());
            println!("{}", session.inspect(&name)?);
            match Tiktoken::new(session.models().student.model_name()) {
                Ok(counter) => println!("\n~{} tokens", token_count(session.program(&name)?, &counter)),
                Err(e) => warn!("Cannot count tokens: {}", e),
            }
        }
        Command::Compare { a, b, inline } => {
            let diff = session.compare(&a, &b)?;
            if diff.is_identical() {
                println!("'{}' and '{}' render identically", a, b);
            } else if inline {
                printer.print_diff(&diff)?;
            } else {
                println!("{}", diff.render_side_by_side());
            }
        }
    }
    Ok(())
}

fn report(printer: &MarkdownPrinter, outcome: &OptimizationOutcome) -> Result<()> {
    let report = &outcome.report;
    match &outcome.saved_as {
        Some(name) => printer.print(&format!(
            "Optimization complete! New program created: `{}`\n\nBaseline score: **{:.3}**, best score: **{:.3}** after {} trials\n",
            name,
            report.baseline_score,
            report.best_score,
            report.trials.len()
        ))?,
        None => printer.print("Nothing to optimize on, no program was created.\n")?,
    }
    Ok(())
}

fn prompt_line(question: &str) -> Result<String> {
    print!("{}", question);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn ask_feedback(session: &mut Session, text: &str, prediction: &Prediction) -> Result<()> {
    let answer = prompt_line("Was this prediction correct? [y/n] ")?;
    if !answer.eq_ignore_ascii_case("n") && !answer.eq_ignore_ascii_case("no") {
        if answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes") {
            println!("Great! Thanks for confirming.");
        }
        return Ok(());
    }
    let label = loop {
        let label = prompt_line("What was the correct intent? ('?' lists the labels, empty skips) ")?;
        if label.is_empty() {
            return Ok(());
        }
        if label == "?" {
            println!("{}", session.labels().iter().collect::<Vec<_>>().join(", "));
            continue;
        }
        match session.labels().canonicalize(&label) {
            Some(label) => break label.to_string(),
            None => println!("'{}' is not a known intent", label),
        }
    };
    let reasoning = prompt_line("Why was the prediction incorrect? (optional) ")?;
    submit(session, text, prediction, &label, Some(reasoning.as_str()))
}

fn submit(session: &mut Session, text: &str, prediction: &Prediction, label: &str, reasoning: Option<&str>) -> Result<()> {
    match session.submit_feedback(text, Some(&prediction.label), label, reasoning) {
        Ok(_) => {
            println!("Thank you for your feedback!");
            Ok(())
        }
        Err(e) => {
            error!("Could not save feedback: {}", e);
            Err(e.into())
        }
    }
}

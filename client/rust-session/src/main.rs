use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use quizarcade_session::metrics::render_metrics;
use quizarcade_session::models::payment::PRODUCTS;
use quizarcade_session::models::quiz::{DEFAULT_QUESTIONS, FALSE_OPTION, TRUE_OPTION};
use quizarcade_session::models::{AccessBadge, Difficulty, Question, QuestionKind};
use quizarcade_session::{ClientContext, Config, SessionError, VerifyOutcome};

const USAGE: &str = "\
usage: quizarcade [--metrics] <command>

commands:
  status                                  show remaining tokens / free trial
  play <topic> [--count N] [--difficulty easy|medium|hard]
  buy <sku>                               start a checkout (quiz_5, quiz_20, quiz_50)
  verify <checkout_id>                    wait for a checkout to settle
  progress                                show XP, level and streaks";

enum Command {
    Status,
    Play {
        topic: String,
        count: u32,
        difficulty: Difficulty,
    },
    Buy {
        sku: String,
    },
    Verify {
        checkout_id: Option<String>,
    },
    Progress,
}

struct Args {
    command: Command,
    metrics: bool,
}

fn parse_args(raw: Vec<String>) -> anyhow::Result<Args> {
    let metrics = raw.iter().any(|arg| arg == "--metrics");
    let mut args = raw.into_iter().filter(|arg| arg != "--metrics");

    let command = match args.next().as_deref() {
        Some("status") => Command::Status,
        Some("progress") => Command::Progress,
        Some("buy") => Command::Buy {
            sku: args.next().ok_or_else(|| anyhow!("buy requires a product sku"))?,
        },
        Some("verify") => Command::Verify {
            checkout_id: args.next(),
        },
        Some("play") => {
            let mut topic = Vec::new();
            let mut count = DEFAULT_QUESTIONS;
            let mut difficulty = Difficulty::default();
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--count" | "-n" => {
                        count = args
                            .next()
                            .ok_or_else(|| anyhow!("--count requires a value"))?
                            .parse()
                            .context("--count must be a number")?;
                    }
                    "--difficulty" | "-d" => {
                        difficulty = args
                            .next()
                            .ok_or_else(|| anyhow!("--difficulty requires a value"))?
                            .parse()
                            .map_err(|e: String| anyhow!(e))?;
                    }
                    _ => topic.push(arg),
                }
            }
            Command::Play {
                topic: topic.join(" "),
                count,
                difficulty,
            }
        }
        Some(other) => bail!("unknown command '{}'\n\n{}", other, USAGE),
        None => bail!("{}", USAGE),
    };

    Ok(Args { command, metrics })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "quizarcade_session=info,quizarcade=info".into());

    // Logs go to stderr so they don't interleave with the quiz on stdout
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = parse_args(std::env::args().skip(1).collect())?;
    let config = Config::load().context("Failed to load configuration")?;
    tracing::debug!(api = %config.api_base_url, "Configuration loaded");

    let ctx = ClientContext::new(config)?;
    let device_id = ctx.identity.resolve().await;
    tracing::info!(device_id = %device_id, "Device identity resolved");

    let result = match args.command {
        Command::Status => status(&ctx).await,
        Command::Play {
            topic,
            count,
            difficulty,
        } => play(&ctx, &topic, count, difficulty).await,
        Command::Buy { sku } => buy(&ctx, &sku).await,
        Command::Verify { checkout_id } => verify(&ctx, checkout_id.as_deref()).await,
        Command::Progress => progress(&ctx).await,
    };

    if args.metrics {
        let rendered = render_metrics().map_err(|e| anyhow!("Failed to render metrics: {}", e))?;
        println!("{}", rendered);
    }
    result
}

async fn status(ctx: &ClientContext) -> anyhow::Result<()> {
    let status = ctx.access.refresh().await?;
    match status.badge() {
        AccessBadge::FreeTrial => println!("Free trial available"),
        AccessBadge::Tokens(n) => println!("{} quiz tokens remaining", n),
        AccessBadge::NoTokens => {
            println!("No tokens remaining. Buy a pack to keep playing:");
            print_products();
        }
        AccessBadge::Loading => println!("Loading..."),
    }
    Ok(())
}

fn print_products() {
    for product in PRODUCTS.iter() {
        println!(
            "  {:<8} {:>3} quizzes  ${:>5.2}  (${:.2}/quiz){}",
            product.sku,
            product.quizzes,
            product.price_usd,
            product.price_per_quiz(),
            if product.popular { "  popular" } else { "" }
        );
    }
}

async fn play(
    ctx: &ClientContext,
    topic: &str,
    count: u32,
    difficulty: Difficulty,
) -> anyhow::Result<()> {
    // A failed refresh leaves the gate loading, which refuses the start below
    if let Err(e) = ctx.access.refresh().await {
        tracing::warn!(error = %e, "Could not load token status");
    }

    match ctx.session.start(topic, count, difficulty).await {
        Ok(()) => {}
        Err(e) if e.requires_payment() => {
            println!("{}", e);
            println!("Buy a pack with `quizarcade buy <sku>`:");
            print_products();
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let session = ctx
        .session
        .session()
        .ok_or_else(|| anyhow!("session missing after generation"))?;
    if session.is_free_trial {
        println!("Free trial quiz on {}", session.topic);
    } else if let Some(tokens) = session.tokens_remaining {
        println!("Quiz on {} ({} tokens left)", session.topic, tokens);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let total = session.questions.len();
    for (index, question) in session.questions.iter().enumerate() {
        println!("\n[{}/{}] {}", index + 1, total, question.prompt);
        let answer = ask(&mut lines, question).await?;
        ctx.session.set_answer(&question.id, &answer)?;
        ctx.session.next()?;
    }

    let result = loop {
        match ctx.session.submit().await {
            Ok(result) => break result,
            Err(SessionError::Client(e)) if e.is_retryable() => {
                println!("Submission failed: {}. Press enter to retry.", e.user_message());
                if lines.next_line().await?.is_none() {
                    return Ok(());
                }
            }
            Err(e) => return Err(e.into()),
        }
    };

    println!(
        "\n{}/{} correct ({:.0}%), +{} XP, level {}, streak {}",
        result.correct_count,
        result.total_count,
        result.accuracy_percent(),
        result.xp_earned,
        result.new_level,
        result.streak
    );
    for achievement in &result.new_achievements {
        println!("Achievement unlocked: {}", achievement);
    }
    for (question, outcome) in session.questions.iter().zip(&result.results) {
        if !outcome.correct {
            println!(
                "  x {} -> {} ({})",
                question.prompt, outcome.correct_answer, outcome.explanation
            );
        }
    }

    ctx.session.reset();
    Ok(())
}

async fn ask(lines: &mut Lines<BufReader<Stdin>>, question: &Question) -> anyhow::Result<String> {
    match question.kind {
        QuestionKind::MultipleChoice => {
            for option in question.options.iter().flatten() {
                println!("  {}) {}", option.id, option.text);
            }
        }
        QuestionKind::TrueFalse => println!("  true / false"),
        QuestionKind::FillBlank => println!("  (type your answer)"),
    }

    loop {
        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("input closed before the quiz was finished"))?;
        let answer = match question.kind {
            QuestionKind::TrueFalse => match line.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "a" => TRUE_OPTION.to_string(),
                "f" | "false" | "b" => FALSE_OPTION.to_string(),
                _ => String::new(),
            },
            QuestionKind::MultipleChoice => line.trim().to_ascii_uppercase(),
            QuestionKind::FillBlank => line.trim().to_string(),
        };
        if question.accepts(&answer) {
            return Ok(answer);
        }
        println!("Please enter a valid answer.");
    }
}

async fn buy(ctx: &ClientContext, sku: &str) -> anyhow::Result<()> {
    let redirect = ctx
        .checkout
        .initiate(sku, ctx.config.success_url.as_str())
        .await?;
    println!("Open this page to pay:\n  {}", redirect.redirect_url);
    println!(
        "Then run `quizarcade verify {}` to collect your tokens.",
        redirect.checkout_id
    );
    Ok(())
}

async fn verify(ctx: &ClientContext, checkout_id: Option<&str>) -> anyhow::Result<()> {
    if let Err(e) = ctx.access.refresh().await {
        tracing::warn!(error = %e, "Could not load token status");
    }

    let handle = ctx.checkout.verify(checkout_id);
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    println!("Waiting for payment confirmation (Ctrl-C to stop)...");
    match handle.outcome().await {
        VerifyOutcome::Completed { tokens_added, .. } => {
            println!(
                "Payment complete: +{} tokens ({} available)",
                tokens_added,
                ctx.access.snapshot().tokens_remaining
            );
            Ok(())
        }
        VerifyOutcome::Failed(e) => bail!("Payment verification failed: {}", e.user_message()),
        VerifyOutcome::Cancelled => {
            println!("Stopped waiting. Run verify again later.");
            Ok(())
        }
    }
}

async fn progress(ctx: &ClientContext) -> anyhow::Result<()> {
    let progress = ctx.api.progress().await?;
    println!(
        "Level {}  XP {} ({:.0}% to next)",
        progress.level,
        progress.xp,
        progress.xp_progress_percent()
    );
    println!(
        "{} questions, {} correct ({:.0}%)",
        progress.total_questions, progress.correct_answers, progress.accuracy_percent
    );
    println!(
        "Streak {} (best {})",
        progress.current_streak, progress.best_streak
    );
    if !progress.achievements.is_empty() {
        println!("Achievements: {}", progress.achievements.join(", "));
    }
    Ok(())
}

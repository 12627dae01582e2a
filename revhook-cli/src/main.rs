use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use revhook_core::{ScoreResponse, SyncReviewRequest, SyncReviewResponse};
use std::io::{self, BufRead};
use std::process::{Command, ExitCode};
use std::thread;
use std::time::{Duration, Instant};

const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// revhook: gate pushes and CI runs on automated review scores
#[derive(Parser, Debug)]
#[command(name = "revhook", version)]
#[command(about = "Client for a revhook review server", long_about = None)]
struct Cli {
    /// Base URL of the revhook server
    #[arg(long, env = "REVHOOK_URL", default_value = "http://localhost:3000")]
    server: String,

    /// Project ID as registered on the server
    #[arg(long, env = "REVHOOK_PROJECT_ID")]
    project_id: i64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Review pushed commits; use as a pre-receive hook (reads stdin)
    Gate(GateArgs),
    /// Show the review score for a commit
    Score(ScoreArgs),
}

#[derive(Parser, Debug)]
struct GateArgs {
    /// Project webhook secret, sent as a bearer token
    #[arg(long, env = "REVHOOK_TOKEN", hide_env_values = true)]
    token: String,

    /// Allow the push when the server cannot be reached
    #[arg(long)]
    fail_open: bool,

    /// Seconds to wait for a verdict
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

#[derive(Parser, Debug)]
struct ScoreArgs {
    /// Commit SHA to look up
    commit: String,

    /// Poll until the review finishes
    #[arg(long)]
    wait: bool,

    /// Seconds to wait when --wait is set
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    /// Seconds between polls
    #[arg(long, default_value_t = 5)]
    interval: u64,
}

/// One `<old> <new> <ref>` line from a pre-receive hook.
#[derive(Debug, PartialEq, Eq)]
struct RefUpdate {
    old: String,
    new: String,
    ref_name: String,
}

fn parse_ref_update(line: &str) -> Result<RefUpdate> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(old), Some(new), Some(ref_name), None) => Ok(RefUpdate {
            old: old.to_string(),
            new: new.to_string(),
            ref_name: ref_name.to_string(),
        }),
        _ => Err(anyhow!("malformed ref update line: {:?}", line)),
    }
}

impl RefUpdate {
    /// Only branch updates that add commits need a review.
    fn needs_review(&self) -> bool {
        self.new != ZERO_SHA && self.ref_name.starts_with("refs/heads/")
    }
}

fn git(args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("git {} failed: {}", args.join(" "), stderr));
    }

    String::from_utf8(output.stdout)
        .with_context(|| format!("Failed to parse output of git {} as UTF-8", args.join(" ")))
}

/// Build the sync request for one ref update from the local repository.
fn collect(project_id: i64, update: &RefUpdate) -> Result<SyncReviewRequest> {
    // A new branch is reviewed as its tip commit alone.
    let (diff, base_commit) = if update.old == ZERO_SHA {
        let diff = git(&[
            "diff-tree",
            "-p",
            "--root",
            "--no-ext-diff",
            "--no-color",
            &update.new,
        ])?;
        (diff, None)
    } else {
        let diff = git(&[
            "diff",
            "--no-ext-diff",
            "--no-color",
            &update.old,
            &update.new,
        ])?;
        (diff, Some(update.old.clone()))
    };

    let meta = git(&["log", "-1", "--format=%an%n%ae%n%B", &update.new])?;
    let mut lines = meta.lines();
    let author_name = lines.next().map(str::to_string).filter(|s| !s.is_empty());
    let author_email = lines.next().map(str::to_string).filter(|s| !s.is_empty());
    let commit_message = lines.collect::<Vec<_>>().join("\n").trim().to_string();

    Ok(SyncReviewRequest {
        project_id,
        commit_hash: update.new.clone(),
        base_commit,
        branch: update.ref_name.clone(),
        author_name,
        author_email,
        commit_message,
        diff,
    })
}

fn error_body(response: reqwest::blocking::Response) -> String {
    let status = response.status();
    let text = response.text().unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or(text);
    format!("{} - {}", status, message)
}

fn run_gate(cli: &Cli, args: &GateArgs) -> Result<bool> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()
        .context("Failed to create HTTP client")?;
    let url = format!("{}/api/review/sync", cli.server.trim_end_matches('/'));

    let mut all_passed = true;
    for line in io::stdin().lock().lines() {
        let line = line.context("Failed to read ref updates from stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let update = parse_ref_update(&line)?;
        if !update.needs_review() {
            continue;
        }
        let request = collect(cli.project_id, &update)?;
        if request.diff.trim().is_empty() {
            continue;
        }

        let short = revhook_core::abbreviate(&update.new, 8);
        let response = match client.post(&url).bearer_auth(&args.token).json(&request).send() {
            Ok(response) => response,
            Err(e) if args.fail_open => {
                eprintln!("revhook: server unreachable, allowing {}: {}", short, e);
                continue;
            }
            Err(e) => return Err(e).context("Failed to reach revhook server"),
        };
        if !response.status().is_success() {
            let detail = error_body(response);
            if args.fail_open && !detail.starts_with('4') {
                eprintln!("revhook: server error, allowing {}: {}", short, detail);
                continue;
            }
            bail!("Review request for {} failed: {}", short, detail);
        }

        let verdict: SyncReviewResponse = response
            .json()
            .context("Failed to parse review response")?;
        match verdict.score {
            Some(score) => eprintln!(
                "revhook: {} on {} scored {:.0} (minimum {:.0}): {}",
                short,
                update.ref_name,
                score,
                verdict.min_score,
                if verdict.passed { "passed" } else { "rejected" }
            ),
            None => eprintln!(
                "revhook: {} on {} is {}{}",
                short,
                update.ref_name,
                verdict.status,
                verdict
                    .error
                    .as_deref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            ),
        }
        if !verdict.passed {
            if let Some(review) = verdict.review.as_deref() {
                eprintln!("\n{}\n", review);
            }
            all_passed = false;
        }
    }
    Ok(all_passed)
}

fn fetch_score(
    client: &reqwest::blocking::Client,
    cli: &Cli,
    commit: &str,
) -> Result<Option<ScoreResponse>> {
    let url = format!("{}/api/review/score", cli.server.trim_end_matches('/'));
    let response = client
        .get(&url)
        .query(&[
            ("project_id", cli.project_id.to_string()),
            ("commit", commit.to_string()),
        ])
        .send()
        .context("Failed to reach revhook server")?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !response.status().is_success() {
        bail!("Score request failed: {}", error_body(response));
    }
    Ok(Some(response.json().context("Failed to parse score response")?))
}

fn run_score(cli: &Cli, args: &ScoreArgs) -> Result<bool> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")?;
    let deadline = Instant::now() + Duration::from_secs(args.timeout);

    loop {
        let score = fetch_score(&client, cli, &args.commit)?;
        let settled = score.as_ref().and_then(|s| s.passed).is_some();
        if settled || !args.wait || Instant::now() >= deadline {
            let Some(score) = score else {
                bail!("No review found for commit {}", args.commit);
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&score).context("Failed to format score")?
            );
            return Ok(score.passed.unwrap_or(false));
        }
        thread::sleep(Duration::from_secs(args.interval));
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Gate(args) => run_gate(&cli, args),
        Commands::Score(args) => run_score(&cli, args),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("revhook: {:#}", e);
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ref_update() {
        let update = parse_ref_update("aaa bbb refs/heads/main").unwrap();
        assert_eq!(
            update,
            RefUpdate {
                old: "aaa".into(),
                new: "bbb".into(),
                ref_name: "refs/heads/main".into(),
            }
        );
        assert!(update.needs_review());

        assert!(parse_ref_update("aaa bbb").is_err());
        assert!(parse_ref_update("aaa bbb refs/heads/main extra").is_err());
    }

    #[test]
    fn test_deletions_and_tags_skip_review() {
        let deletion = parse_ref_update(&format!("aaa {} refs/heads/old", ZERO_SHA)).unwrap();
        assert!(!deletion.needs_review());

        let tag = parse_ref_update("aaa bbb refs/tags/v1.0").unwrap();
        assert!(!tag.needs_review());
    }

    #[test]
    fn test_cli_parses_gate_flags() {
        let cli = Cli::try_parse_from([
            "revhook",
            "--project-id",
            "7",
            "gate",
            "--token",
            "s3cret",
            "--fail-open",
        ])
        .unwrap();
        assert_eq!(cli.project_id, 7);
        match cli.command {
            Commands::Gate(args) => {
                assert_eq!(args.token, "s3cret");
                assert!(args.fail_open);
                assert_eq!(args.timeout, 300);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}

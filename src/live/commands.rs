//! Terminal front end for a live meeting: one command per line on stdin,
//! the current screen redrawn whenever the view changes.

use anyhow::{bail, Result};
use colored::*;
use tokio::io::{self, AsyncBufReadExt, BufReader};

use crate::review::load_review;

use super::{controller::LiveSessionController, view::LiveScreen};

pub const HELP: &str = "\
Commands:
  check | c          start a round: Did you get it?
  prove | p          start a round: Did I get it?
  rate <0-10> | <n>  submit your rating
  ok                 good enough, close the revealed round
  skip               close the revealed round and mark it skipped
  flag [note]        log a misunderstanding for the current or last round
  review             show the meeting so far
  leave              leave the meeting
  end                end the meeting for both of you
  exit | quit        stop watching without changing the meeting
  help               show this list";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingCommand {
    Check,
    Prove,
    Rate(u8),
    Acknowledge,
    Skip,
    Flag(Option<String>),
    Review,
    Leave,
    End,
    Exit,
    Help,
}

fn parse_rating(raw: &str) -> Result<u8> {
    match raw.parse::<u8>() {
        Ok(value) => Ok(value),
        Err(_) => bail!("ratings are whole numbers from 0 to 10, got {raw:?}"),
    }
}

/// Parse one input line. Blank lines give `None`.
pub fn parse_command(line: &str) -> Result<Option<MeetingCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "check" | "c" => MeetingCommand::Check,
        "prove" | "p" => MeetingCommand::Prove,
        "rate" | "r" if rest.is_empty() => bail!("rate needs a number from 0 to 10"),
        "rate" | "r" => MeetingCommand::Rate(parse_rating(rest)?),
        "ok" | "good" => MeetingCommand::Acknowledge,
        "skip" | "s" => MeetingCommand::Skip,
        "flag" | "f" => MeetingCommand::Flag((!rest.is_empty()).then(|| rest.to_string())),
        "review" => MeetingCommand::Review,
        "leave" => MeetingCommand::Leave,
        "end" => MeetingCommand::End,
        "exit" | "quit" | "q" => MeetingCommand::Exit,
        "help" | "h" | "?" => MeetingCommand::Help,
        other if other.chars().all(|c| c.is_ascii_digit()) => {
            MeetingCommand::Rate(parse_rating(other)?)
        }
        other => bail!("unknown command {other:?}, type help for the list"),
    };

    Ok(Some(command))
}

fn draw(screen: &LiveScreen) {
    let heading = match screen {
        LiveScreen::Celebration { .. } => "*".green().bold(),
        LiveScreen::Ended | LiveScreen::Exited => "*".red(),
        _ => "*".cyan(),
    };
    println!();
    for line in screen.to_string().lines() {
        println!("{heading} {line}");
    }
}

async fn print_review(controller: &LiveSessionController) {
    let review = load_review(controller.backend(), controller.session_id(), controller.me()).await;
    println!("\n{}", "Meeting review".bold());
    for line in review.lines() {
        println!("  {line}");
    }
}

/// Returns `true` when the loop should stop.
async fn execute(controller: &LiveSessionController, command: MeetingCommand) -> Result<bool> {
    match command {
        MeetingCommand::Check => {
            controller.start_check().await?;
        }
        MeetingCommand::Prove => {
            controller.start_prove().await?;
        }
        MeetingCommand::Rate(value) => {
            controller.submit_rating(value).await?;
        }
        MeetingCommand::Acknowledge => {
            controller.acknowledge().await?;
        }
        MeetingCommand::Skip => {
            controller.skip().await?;
        }
        MeetingCommand::Flag(note) => {
            let turn = controller.flag_misunderstanding(note).await?;
            println!("{} Flagged round {}", "✓".green(), turn.round);
        }
        MeetingCommand::Review => print_review(controller).await,
        MeetingCommand::Help => println!("{HELP}"),
        MeetingCommand::Leave => {
            controller.leave_meeting().await?;
            return Ok(true);
        }
        MeetingCommand::End => {
            controller.end_meeting().await?;
            controller.exit_meeting().await;
            return Ok(true);
        }
        MeetingCommand::Exit => {
            controller.exit_meeting().await;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Run the interactive loop until the participant leaves, stdin closes, or
/// the meeting ends.
pub async fn run_meeting(controller: LiveSessionController) -> Result<()> {
    let mut views = controller.watch();
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut shown = controller.screen();
    draw(&shown);
    println!("{}", "Type help for commands.".dimmed());

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let screen = controller.screen();
                if screen != shown {
                    draw(&screen);
                    shown = screen;
                }
                if matches!(shown, LiveScreen::Ended | LiveScreen::Exited) {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    controller.exit_meeting().await;
                    break;
                };
                let command = match parse_command(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{} {e}", "!".yellow());
                        continue;
                    }
                };
                match execute(&controller, command).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => println!("{} {e:#}", "!".yellow()),
                }
            }
        }
    }

    print_review(&controller).await;
    Ok(())
}

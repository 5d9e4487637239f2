//! A read-eval loop over one card session, so you can poke at a card
//! without re-selecting everything between commands.

use crate::{Command, Opt};
use clap::Parser;
use kestrel::transport::Pcsc;
use kestrel::Session;
use owo_colors::OwoColorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(Debug, Parser)]
#[command(name = "kestrel", no_binary_name = true, disable_version_flag = true)]
struct ShellOpt {
    #[command(subcommand)]
    cmd: Command,
}

pub fn run(session: &mut Session<Pcsc>, opt: &Opt) -> anyhow::Result<()> {
    let mut editor = DefaultEditor::new()?;
    println!("{} card shell; 'help' lists commands, 'exit' leaves.", "kestrel".cyan());

    loop {
        let line = match editor.readline("kestrel> ") {
            Ok(line) => line,
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(e) => return Err(e.into()),
        };
        let words = match shellwords::split(&line) {
            Ok(words) => words,
            Err(_) => {
                eprintln!("{}", "unterminated quotes".red());
                continue;
            }
        };
        if words.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(&line);
        match words[0].as_str() {
            "exit" | "quit" => break,
            _ => {}
        }

        match ShellOpt::try_parse_from(&words) {
            Ok(shell_opt) => {
                if let Err(e) = eval(session, opt, &shell_opt.cmd) {
                    eprintln!("{}", format!("{e:#}").red());
                }
            }
            // Clap renders its own help/usage output for bad input.
            Err(e) => print!("{e}"),
        }
    }
    Ok(())
}

fn eval(session: &mut Session<Pcsc>, opt: &Opt, cmd: &Command) -> anyhow::Result<()> {
    match cmd {
        Command::Readers | Command::Wait | Command::Shell => {
            anyhow::bail!("not available inside the shell")
        }
        Command::Info => crate::cmd_info(session, opt),
        Command::SelectPse => crate::cmd_select_pse(session, opt),
        Command::SelectApp { aid } => crate::cmd_select_app(session, opt, aid),
        Command::ListApps => crate::cmd_list_apps(session, opt),
        Command::ReadRecord { sfi, record } => crate::cmd_read_record(session, opt, *sfi, *record),
        Command::GetData { tag } => crate::cmd_get_data(session, opt, tag),
        Command::VerifyPin { pin } => crate::cmd_verify_pin(session, opt, pin),
        Command::Dump => crate::cmd_dump(session, opt),
    }
}

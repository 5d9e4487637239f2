mod output;
mod shell;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kestrel::emv::tags;
use kestrel::transport::Pcsc;
use kestrel::{atr, ber, Session};
use owo_colors::OwoColorize;
use pad::PadStr;
use serde_json::json;
use tap::TapOptional;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kestrel", version, about = "Talk to EMV payment cards")]
struct Opt {
    /// Connect to this reader; default is the first one with a card.
    #[arg(short, long, global = true)]
    reader: Option<String>,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Every time you -v, it gets noisier (up to -vvv).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List all connected readers.
    Readers,
    /// Wait for a card to show up, then identify it.
    Wait,
    /// Show reader and ATR details for the inserted card.
    Info,
    /// SELECT the Payment System Environment and print its FCI.
    SelectPse,
    /// SELECT an application and print its FCI.
    SelectApp {
        /// AID in hex, eg. A0000000031010.
        aid: String,
    },
    /// List the applications the PSE directory advertises.
    ListApps,
    /// READ RECORD from a file.
    ReadRecord { sfi: u8, record: u8 },
    /// GET DATA for a primitive data object.
    GetData {
        /// Tag in hex, eg. 9F17.
        tag: String,
    },
    /// VERIFY the PIN against the chip. Wrong guesses burn real attempts.
    VerifyPin { pin: String },
    /// Walk every application on the card and dump its records.
    Dump,
    /// Interactive shell against one card.
    Shell,
}

fn main() -> std::process::ExitCode {
    let opt = Opt::parse();
    init_logging(opt.verbose);
    match run(&opt.cmd, &opt) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn init_logging(verbosity: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }))
        .with_writer(std::io::stderr)
        .init();
}

fn connect(opt: &Opt) -> anyhow::Result<Session<Pcsc>> {
    Ok(Session::new(
        Pcsc::connect(opt.reader.as_deref()).context("couldn't connect to a card")?,
    ))
}

fn run(cmd: &Command, opt: &Opt) -> anyhow::Result<()> {
    match cmd {
        Command::Readers => {
            let readers = Pcsc::list_readers().context("couldn't list readers")?;
            if opt.format == Format::Json {
                emit(json!({ "readers": readers }));
            } else {
                for (i, name) in readers.iter().enumerate() {
                    println!("{i:3} {name}");
                }
            }
            Ok(())
        }
        Command::Wait => {
            let session = Session::new(
                Pcsc::wait_for_card(opt.reader.as_deref()).context("couldn't wait for a card")?,
            );
            cmd_info(&session, opt)
        }
        Command::Info => {
            let session = connect(opt)?;
            cmd_info(&session, opt)
        }
        Command::SelectPse => cmd_select_pse(&mut connect(opt)?, opt),
        Command::SelectApp { aid } => cmd_select_app(&mut connect(opt)?, opt, aid),
        Command::ListApps => cmd_list_apps(&mut connect(opt)?, opt),
        Command::ReadRecord { sfi, record } => {
            cmd_read_record(&mut connect(opt)?, opt, *sfi, *record)
        }
        Command::GetData { tag } => cmd_get_data(&mut connect(opt)?, opt, tag),
        Command::VerifyPin { pin } => cmd_verify_pin(&mut connect(opt)?, opt, pin),
        Command::Dump => cmd_dump(&mut connect(opt)?, opt),
        Command::Shell => shell::run(&mut connect(opt)?, opt),
    }
}

fn emit(value: serde_json::Value) {
    println!("{value}");
}

fn cmd_info(session: &Session<Pcsc>, opt: &Opt) -> anyhow::Result<()> {
    let raw = session.atr().context("couldn't read ATR")?;
    let parsed = atr::parse(&raw).context("couldn't parse ATR")?;
    let protocols: Vec<String> = parsed
        .protocols()
        .iter()
        .map(|p| format!("{p:?}"))
        .collect();

    if opt.format == Format::Json {
        emit(json!({
            "reader": session.reader_name(),
            "atr": hex::encode_upper(&raw),
            "convention": format!("{:?}", parsed.convention),
            "protocols": protocols,
            "historical_bytes": hex::encode_upper(&parsed.historical),
        }));
        return Ok(());
    }

    println!("Reader      {}", session.reader_name());
    println!("ATR         {}", hex::encode_upper(&raw).cyan());
    println!("Convention  {:?}", parsed.convention);
    println!("Protocols   {}", protocols.join(", "));
    println!(
        "Historical  {}",
        hex::encode_upper(&parsed.historical).dimmed()
    );
    parsed
        .tck
        .tap_some(|tck| println!("TCK         {tck:02X}"));
    Ok(())
}

fn cmd_select_pse(session: &mut Session<Pcsc>, opt: &Opt) -> anyhow::Result<()> {
    let data = session
        .select_pse()
        .and_then(|r| r.require_ok())
        .context("SELECT PSE failed")?;
    print_fci(&data, opt)
}

fn cmd_select_app(session: &mut Session<Pcsc>, opt: &Opt, aid: &str) -> anyhow::Result<()> {
    let aid = hex::decode(aid).context("AID must be hex")?;
    let data = session
        .select_application(&aid)
        .and_then(|r| r.require_ok())
        .context("SELECT failed")?;
    print_fci(&data, opt)
}

fn print_fci(data: &[u8], opt: &Opt) -> anyhow::Result<()> {
    let tlvs = ber::parse(data).context("couldn't parse FCI")?;
    if opt.format == Format::Json {
        emit(json!({ "fci": output::tlv_to_json(&tlvs) }));
    } else {
        output::print_tree(&tlvs, 0);
    }
    Ok(())
}

fn cmd_list_apps(session: &mut Session<Pcsc>, opt: &Opt) -> anyhow::Result<()> {
    let dir = session
        .discover_applications()
        .context("PSE discovery failed")?;
    if opt.format == Format::Json {
        emit(serde_json::to_value(&dir)?);
        return Ok(());
    }
    if let Some(langs) = &dir.language_preference {
        println!("Languages: {langs}");
    }
    for app in &dir.applications {
        println!(
            "{} {} {}",
            hex::encode_upper(&app.aid).pad_to_width(32).cyan(),
            app.label.as_deref().unwrap_or("-").pad_to_width(16),
            app.priority.map_or("-".into(), |p| p.to_string()),
        );
    }
    Ok(())
}

fn cmd_read_record(
    session: &mut Session<Pcsc>,
    opt: &Opt,
    sfi: u8,
    record: u8,
) -> anyhow::Result<()> {
    let data = session
        .read_record(sfi, record)
        .and_then(|r| r.require_ok())
        .with_context(|| format!("READ RECORD {sfi}.{record} failed"))?;
    let tlvs = ber::parse_records(&data).unwrap_or_default();
    if opt.format == Format::Json {
        emit(json!({
            "sfi": sfi,
            "record": record,
            "data": hex::encode_upper(&data),
            "tlv": output::tlv_to_json(&tlvs),
        }));
    } else {
        output::print_tree(&tlvs, 0);
    }
    Ok(())
}

fn cmd_get_data(session: &mut Session<Pcsc>, opt: &Opt, tag: &str) -> anyhow::Result<()> {
    let tag = u32::from_str_radix(tag.trim_start_matches("0x"), 16).context("tag must be hex")?;
    let data = session
        .get_data(tag)
        .and_then(|r| r.require_ok())
        .with_context(|| format!("GET DATA {tag:04X} failed"))?;
    if opt.format == Format::Json {
        emit(json!({
            "tag": format!("{tag:04X}"),
            "name": tags::name(ber::Tag(tag)),
            "data": hex::encode_upper(&data),
        }));
    } else {
        println!(
            "{} {} {}",
            format!("{tag:04X}").cyan(),
            tags::name(ber::Tag(tag)).dimmed(),
            hex::encode_upper(&data)
        );
    }
    Ok(())
}

fn cmd_verify_pin(session: &mut Session<Pcsc>, opt: &Opt, pin: &str) -> anyhow::Result<()> {
    session.verify_pin(pin).context("VERIFY failed")?;
    if opt.format == Format::Json {
        emit(json!({ "verified": true }));
    } else {
        println!("PIN verified.");
    }
    Ok(())
}

/// Selects each PSE application in turn and brute-force reads the records
/// behind the first few SFIs. Read-only; GPO and GENERATE AC are never
/// issued, so nothing on the card ticks over.
fn cmd_dump(session: &mut Session<Pcsc>, opt: &Opt) -> anyhow::Result<()> {
    let dir = session
        .discover_applications()
        .context("PSE discovery failed")?;

    let mut apps = Vec::new();
    for app in &dir.applications {
        let fci = session
            .select_application(&app.aid)
            .and_then(|r| r.require_ok())
            .with_context(|| format!("SELECT {} failed", hex::encode_upper(&app.aid)))?;

        if opt.format == Format::Text {
            println!(
                "==== {} {}",
                hex::encode_upper(&app.aid).cyan(),
                app.label.as_deref().unwrap_or("").green()
            );
            output::print_tree(&ber::parse(&fci).unwrap_or_default(), 0);
        }

        let mut records = Vec::new();
        for sfi in 1..=10u8 {
            for record in 1..=16u8 {
                let res = session.read_record(sfi, record)?;
                if !res.is_ok() {
                    break;
                }
                let tlvs = ber::parse_records(&res.data).unwrap_or_default();
                if opt.format == Format::Text {
                    println!("---- SFI {sfi} record {record}");
                    output::print_tree(&tlvs, 0);
                }
                records.push(json!({
                    "sfi": sfi,
                    "record": record,
                    "data": hex::encode_upper(&res.data),
                    "tlv": output::tlv_to_json(&tlvs),
                }));
            }
        }
        apps.push(json!({
            "aid": hex::encode_upper(&app.aid),
            "label": app.label,
            "fci": output::tlv_to_json(&ber::parse(&fci).unwrap_or_default()),
            "records": records,
        }));
    }

    if opt.format == Format::Json {
        emit(json!({
            "language_preference": dir.language_preference,
            "applications": apps,
        }));
    }
    Ok(())
}

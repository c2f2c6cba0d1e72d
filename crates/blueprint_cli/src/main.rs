use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use blueprint_cli::{run, CommandKind, CommonOptions};

fn main() -> ExitCode {
    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::from(1)
        }
    }
}

fn run_cli() -> Result<(), String> {
    let args = env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        return Err(usage_text());
    }
    if args[0] == "-h" || args[0] == "--help" {
        print_usage();
        return Ok(());
    }

    let mut options = CommonOptions::default();
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "--root" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --root".to_string())?;
                options.root = PathBuf::from(value);
                index += 2;
            }
            "--catalog" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --catalog".to_string())?;
                options.catalog = Some(PathBuf::from(value));
                index += 2;
            }
            "--max-extent" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --max-extent".to_string())?;
                let parsed = value
                    .parse::<i32>()
                    .map_err(|_| format!("invalid --max-extent value '{value}' (expected i32)"))?;
                options.max_extent = Some(parsed);
                index += 2;
            }
            _ => break,
        }
    }

    let command = args
        .get(index)
        .ok_or_else(|| "missing subcommand".to_string())?
        .as_str();
    let command_args = &args[(index + 1)..];

    let kind = match command {
        "inspect" => {
            let id = command_args
                .first()
                .ok_or_else(|| "inspect requires a blueprint id".to_string())?
                .clone();
            let rotation = match &command_args[1..] {
                [] => None,
                [flag, value] if flag == "--rotation" => Some(
                    value
                        .parse::<i32>()
                        .map_err(|_| format!("invalid --rotation value '{value}' (expected i32)"))?,
                ),
                _ => return Err("inspect accepts only --rotation <degrees>".to_string()),
            };
            CommandKind::Inspect { id, rotation }
        }
        "materials" => {
            if command_args.len() != 1 {
                return Err("materials requires exactly one blueprint id".to_string());
            }
            CommandKind::Materials {
                id: command_args[0].clone(),
            }
        }
        "compile" => {
            if command_args.len() < 2 {
                return Err("compile requires a source file and a blueprint id".to_string());
            }
            let source = PathBuf::from(&command_args[0]);
            let id = command_args[1].clone();
            let out = match &command_args[2..] {
                [] => None,
                [flag, value] if flag == "--out" => Some(PathBuf::from(value)),
                _ => return Err("compile accepts only --out <file>".to_string()),
            };
            CommandKind::Compile { source, id, out }
        }
        "list" => {
            if !command_args.is_empty() {
                return Err("list takes no arguments".to_string());
            }
            CommandKind::List
        }
        other => return Err(format!("unknown subcommand '{other}'")),
    };

    run(kind, options, &mut io::stdout())
}

fn print_usage() {
    println!("{}", usage_text());
}

fn usage_text() -> String {
    [
        "blueprint - blueprint authoring tool",
        "",
        "Usage:",
        "  blueprint [--root <dir>] [--max-extent <i32>] inspect <id> [--rotation <degrees>]",
        "  blueprint [--root <dir>] [--catalog <materials.xml>] materials <id>",
        "  blueprint [--root <dir>] [--max-extent <i32>] compile <source.json> <id> [--out <file>]",
        "  blueprint [--root <dir>] list",
        "",
        "Defaults:",
        "  --root data/blueprints",
        "  --max-extent 128",
    ]
    .join("\n")
}

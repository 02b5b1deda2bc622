//! # Track Inspector
//!
//! Command-line tool to load, validate and summarize a profiling track.

use std::fs::File;
use std::io::BufReader;
use std::process::ExitCode;

use tessera_memory::{GroupId, GroupRecord, Track};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        println!("Usage: track_inspect <file.tmtr> [--replay] [--events]");
        println!();
        println!("Options:");
        println!("  --replay     Show counters after replaying every event");
        println!("  --events     List every event after the snapshot");
        return ExitCode::FAILURE;
    }

    let path = &args[1];
    let show_replay = args.iter().any(|a| a == "--replay");
    let show_events = args.iter().any(|a| a == "--events");

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: could not open {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let track = match Track::read_from(&mut BufReader::new(file)) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: invalid track {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("┌─ TRACK ──────────────────────────────────────────────────────────");
    println!("│ File:               {path}");
    println!("│ Snapshot sequence:  {}", track.snapshot_sequence());
    println!("│ Last sequence:      {}", track.last_sequence());
    println!("│ Groups:             {}", track.groups().len());
    println!("│ Events:             {}", track.events().len());
    println!("└──────────────────────────────────────────────────────────────────");
    println!();

    println!("Snapshot:");
    print_tree(track.groups(), track.root(), 1);

    if show_events {
        println!();
        println!("Events:");
        for event in track.events() {
            println!(
                "  #{:<8} {:>6} {:<13} {:>12}",
                event.sequence,
                event.group.to_string(),
                event.kind.label(),
                event.size
            );
        }
    }

    if show_replay {
        println!();
        println!("Replayed:");
        print_tree(&track.replay(), track.root(), 1);
    }

    ExitCode::SUCCESS
}

fn print_tree(groups: &[GroupRecord], id: GroupId, depth: usize) {
    let Some(group) = groups.iter().find(|g| g.id == id) else {
        return;
    };
    println!(
        "{:indent$}{} {}  reserved={} used={}",
        "",
        group.id,
        group.name,
        group.counters.reserved,
        group.counters.used,
        indent = depth * 2
    );
    for child in groups.iter().filter(|g| g.parent == Some(id)) {
        print_tree(groups, child.id, depth + 1);
    }
}

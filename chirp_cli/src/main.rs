mod audio_driver;

use std::io::BufRead;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chirp_core::player::Player;
use clap::{App, Arg};

fn main() {
    env_logger::init();
    let matches = App::new("chirp")
        .version("0.1")
        .about("Game Boy Sound (GBS) player")
        .arg(
            Arg::with_name("FILE")
                .help("GBS file to play")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("SONG")
                .help("0-based song index, defaults to the file's starting song")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("SECONDS")
                .help("Stop after this many seconds instead of waiting for 'q' on stdin")
                .takes_value(true),
        )
        .get_matches();

    let path = matches.value_of("FILE").unwrap();
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error opening file: {}", e);
            process::exit(1);
        }
    };

    // The device is opened first so the core synthesizes at whatever
    // rate it actually negotiated
    let driver = match audio_driver::AudioDriver::new() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let mut player = match Player::power_on(&data, driver.sample_rate()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let song = match matches.value_of("SONG") {
        Some(s) => match s.parse::<u8>() {
            Ok(v) => v,
            Err(_) => {
                eprintln!("Error: song index must be a number from 0 to 255");
                process::exit(1);
            }
        },
        None => player.header().start_song,
    };

    let play_seconds = match matches.value_of("SECONDS") {
        Some(s) => match s.parse::<f64>() {
            Ok(v) if v >= 0.0 => Some(v),
            _ => {
                eprintln!("Error: play time must be a non-negative number of seconds");
                process::exit(1);
            }
        },
        None => None,
    };

    {
        let h = player.header();
        println!("Title:     {}", h.title);
        println!("Author:    {}", h.author);
        println!("Copyright: {}", h.copyright);
        println!("Song:      {} of {}", u32::from(song) + 1, h.song_count);
    }

    if let Err(e) = player.run_init(song) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    let player = Arc::new(Mutex::new(player));
    let _stream = match driver.start(player) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    match play_seconds {
        Some(secs) => spin_sleep::sleep(Duration::from_secs_f64(secs)),
        None => {
            println!("Playing, 'q' + Enter quits");
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(l) if l.trim() == "q" => break,
                    Ok(_) => (),
                    Err(_) => break,
                }
            }
        }
    }
}

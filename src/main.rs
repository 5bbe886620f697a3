use relayd::{config::Config, Options, Privsep};
use std::{env, process};

#[tokio::main]
async fn main() {
    let opts = Options::new();

    let matches = match opts.parse() {
        Ok(matches) => matches,
        Err(_) => process::exit(1),
    };

    // Config test mode: parse, report, exit.
    if matches.opt_present("n") {
        let path = matches
            .opt_str("f")
            .unwrap_or_else(|| relayd::RELAYD_CONFIG.to_string());
        let mut variables = relayd::config::Variables::new();
        for variable in matches.opt_strs("D") {
            match variable.split_once('=') {
                Some((key, value)) => {
                    variables.insert(key.to_string(), value.to_string());
                }
                None => {
                    eprintln!("{}: invalid macro: {}", opts, variable);
                    process::exit(1);
                }
            }
        }
        match Config::load(&path, variables).await {
            Ok(_) => {
                println!("configuration OK");
                process::exit(0);
            }
            Err(err) => {
                eprintln!("{}: {}", opts, err);
                process::exit(1);
            }
        }
    }

    let log_level = env::var("RUST_LOG")
        .unwrap_or_else(|_| privsep_log::verbose(matches.opt_count("v")))
        .into();

    let config = privsep::Config {
        foreground: matches.opt_present("d"),
        log_level,
    };

    if let Err(err) = Privsep::main(config).await {
        eprintln!("{}: {}", opts, err);
        process::exit(1);
    }
}

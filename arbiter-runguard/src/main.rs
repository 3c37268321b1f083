use std::env;
use std::io::Read;
use std::process;

use anyhow::Result;
use arbiter_runguard::RunguardOptions;
use structopt::StructOpt;

fn load_options() -> Result<RunguardOptions> {
    let mut stdin_content = Vec::new();
    match env::var("ARBITER_RUNGUARD_ARGPASS").as_deref() {
        Ok("JSON") => {
            std::io::stdin().read_to_end(&mut stdin_content)?;
            Ok(serde_json::from_slice(&stdin_content)?)
        }
        Ok("BINCODE") => {
            std::io::stdin().read_to_end(&mut stdin_content)?;
            Ok(bincode::deserialize(&stdin_content)?)
        }
        _ => Ok(RunguardOptions::from_args()),
    }
}

fn main() {
    env_logger::init();

    let code = match load_options().and_then(|opt| arbiter_runguard::run(&opt)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("runguard: {:#}", err);
            1
        }
    };

    process::exit(code);
}

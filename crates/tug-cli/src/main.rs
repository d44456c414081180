use std::{env, fs, process::ExitCode};

use tug::{Runtime, TaskState, stdlib};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let file_path = if args.len() > 1 { &args[1] } else { "main.tug" };
    let code = match read_file(file_path) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut rt = Runtime::new();
    let task = match rt.compile(file_path, &code) {
        Ok(task) => task,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    stdlib::install(&mut rt, task);
    rt.resume(task);
    // cooperative pauses hand control back here; keep going until the script
    // finishes or fails
    while rt.state(task) == TaskState::Yielded {
        rt.resume(task);
    }

    if rt.state(task) == TaskState::Error {
        eprintln!("{}", rt.error_traceback(task));
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn read_file(file_path: &str) -> Result<String, String> {
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{file_path} is not a file"));
            }
        }
        Err(err) => {
            return Err(format!("unable to read {file_path}: {err}"));
        }
    }
    fs::read_to_string(file_path).map_err(|err| format!("unable to read {file_path}: {err}"))
}

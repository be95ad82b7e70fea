use std::path;
use std::process;
use std::thread;
use std::time::Duration;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use line_sort::{
    CancellationToken, HeapSorterBuilder, MergeSorterBuilder, Outcome, ProgressHandle, SortError, Validation,
    ValidatorBuilder,
};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let cancel = CancellationToken::new();
    let succeeded = match arg_parser.subcommand() {
        Some(("heap", args)) => heap_sort(args, &cancel),
        Some(("merge", args)) => merge_sort(args, &cancel),
        Some(("validate", args)) => validate(args, &cancel),
        _ => unreachable!("subcommand is required"),
    };

    if !succeeded {
        process::exit(1);
    }
}

fn heap_sort(args: &clap::ArgMatches, cancel: &CancellationToken) -> bool {
    let input = input_path(args);

    let mut builder = HeapSorterBuilder::new()
        .with_buf_size(byte_size(args, "buffer_size") as usize)
        .with_ram_index(args.is_present("ram_index"));
    if let Some(index_file) = args.value_of("index_file") {
        builder = builder.with_index_path(path::Path::new(index_file));
    }
    if args.is_present("chunk_size") {
        builder = builder.with_chunk_size(args.value_of_t_or_exit("chunk_size"));
    }

    let sorter = match builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            return false;
        }
    };

    let result = run_with_progress(sorter.progress(), || sorter.sort(input, cancel));
    return report_sort(result);
}

fn merge_sort(args: &clap::ArgMatches, cancel: &CancellationToken) -> bool {
    let input = input_path(args);

    let mut builder = MergeSorterBuilder::new()
        .with_buf_size(byte_size(args, "buffer_size") as usize)
        .with_run_size(byte_size(args, "run_size"));
    if let Some(run_dir) = args.value_of("run_dir") {
        builder = builder.with_run_dir(path::Path::new(run_dir));
    }
    if args.is_present("threads") {
        builder = builder.with_max_workers(args.value_of_t_or_exit("threads"));
    }

    let sorter = match builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            return false;
        }
    };

    let result = run_with_progress(sorter.progress(), || sorter.sort(input, cancel));
    return report_sort(result);
}

fn validate(args: &clap::ArgMatches, cancel: &CancellationToken) -> bool {
    let input = input_path(args);

    let validator = match ValidatorBuilder::new()
        .with_buf_size(byte_size(args, "buffer_size") as usize)
        .build()
    {
        Ok(validator) => validator,
        Err(err) => {
            log::error!("validator initialization error: {}", err);
            return false;
        }
    };

    match run_with_progress(validator.progress(), || validator.validate(input, cancel)) {
        Ok(Validation::Valid) => true,
        Ok(Validation::Invalid(_)) | Ok(Validation::Cancelled) => false,
        Err(err) => {
            log::error!("data validation error: {}", err);
            false
        }
    }
}

fn report_sort(result: Result<Outcome, SortError>) -> bool {
    match result {
        Ok(Outcome::Sorted(_)) => true,
        Ok(Outcome::Cancelled) => false,
        Err(err) => {
            log::error!("data sorting error: {}", err);
            false
        }
    }
}

/// Runs an operation on a worker thread, logging its progress from the current one until it is done.
fn run_with_progress<T: Send>(progress: ProgressHandle, operation: impl FnOnce() -> T + Send) -> T {
    thread::scope(|scope| {
        let worker = scope.spawn(operation);

        let mut reported = None;
        while !worker.is_finished() {
            let current = progress.get();
            if reported != Some(current) {
                log::debug!("progress: {}%", current);
                reported = Some(current);
            }
            thread::sleep(PROGRESS_INTERVAL);
        }

        match worker.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}

fn input_path(args: &clap::ArgMatches) -> &path::Path {
    path::Path::new(args.value_of("input").expect("value is required"))
}

fn byte_size(args: &clap::ArgMatches, name: &str) -> u64 {
    args.value_of(name)
        .expect("value has a default")
        .parse::<ByteSize>()
        .expect("value is pre-validated")
        .as_u64()
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn validate_byte_size(value: &str) -> Result<(), String> {
    match value.parse::<ByteSize>() {
        Ok(_) => Ok(()),
        Err(err) => Err(format!("Size format incorrect: {}", err)),
    }
}

fn input_arg() -> clap::Arg<'static> {
    clap::Arg::new("input")
        .short('i')
        .long("input")
        .help("file to be processed in place")
        .required(true)
        .takes_value(true)
}

fn buffer_size_arg() -> clap::Arg<'static> {
    clap::Arg::new("buffer_size")
        .short('b')
        .long("buffer-size")
        .help("I/O buffer size, every record must fit into it")
        .takes_value(true)
        .default_value("1MiB")
        .validator(validate_byte_size)
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("line-sort")
        .about("external sorter of <key>.<payload> record files")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .global(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .subcommand(
            clap::App::new("heap")
                .about("index-based heap sort")
                .arg(input_arg())
                .arg(buffer_size_arg())
                .arg(
                    clap::Arg::new("ram_index")
                        .short('r')
                        .long("ram-index")
                        .help("keep the record index in memory instead of a file"),
                )
                .arg(
                    clap::Arg::new("index_file")
                        .short('x')
                        .long("index-file")
                        .help("index file path, <input>.idx by default")
                        .takes_value(true)
                        .conflicts_with("ram_index"),
                )
                .arg(
                    clap::Arg::new("chunk_size")
                        .short('c')
                        .long("chunk-size")
                        .help("number of entries per in-memory index chunk")
                        .takes_value(true)
                        .requires("ram_index"),
                ),
        )
        .subcommand(
            clap::App::new("merge")
                .about("run-based k-way merge sort")
                .arg(input_arg())
                .arg(buffer_size_arg())
                .arg(
                    clap::Arg::new("run_size")
                        .short('s')
                        .long("run-size")
                        .help("maximum number of bytes sorted in memory at once")
                        .takes_value(true)
                        .default_value("1GiB")
                        .validator(validate_byte_size),
                )
                .arg(
                    clap::Arg::new("run_dir")
                        .short('d')
                        .long("run-dir")
                        .help("directory to be used to store sorted runs")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("threads")
                        .short('t')
                        .long("threads")
                        .help("maximum number of runs created concurrently")
                        .takes_value(true),
                ),
        )
        .subcommand(
            clap::App::new("validate")
                .about("check that a file is sorted and made of valid records")
                .arg(input_arg())
                .arg(buffer_size_arg()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}

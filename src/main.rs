use std::fs;
use std::io;
use std::path;
use std::process;
use std::time::Instant;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use bigsort::{find_partitions, ExternalSorter, ExternalSorterBuilder, Phase, Progress, PARTITION_FILE_PATTERN};

const MEGABYTE: f64 = 1_048_576.0;

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    match arg_parser.subcommand() {
        Some(("sort", args)) => sort(args),
        Some(("merge", args)) => merge(args),
        _ => unreachable!("subcommand is required"),
    }
}

fn sort(args: &clap::ArgMatches) {
    let input = path::Path::new(args.value_of("input").expect("value is required"));
    let output = path::Path::new(args.value_of("output").expect("value is required"));

    let mut sorter_builder = init_sorter_builder(args);
    if let Some(tmp_dir) = args.value_of("tmp_dir") {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }
    if args.is_present("buffer_entries") {
        sorter_builder = sorter_builder.with_buffer_capacity(args.value_of_t_or_exit("buffer_entries"));
    }
    if let Some(arena_size) = args.value_of("arena_size") {
        sorter_builder = sorter_builder.with_arena_capacity(parse_size(arena_size) as usize);
    }
    if let Some(threshold) = args.value_of("small_threshold") {
        sorter_builder = sorter_builder.with_small_file_threshold(parse_size(threshold));
    }
    sorter_builder = sorter_builder.with_keep_partitions(args.is_present("keep_partitions"));

    let sorter = build_sorter(sorter_builder);
    match sorter.sort_file(input, output) {
        Ok(stats) => log::info!(
            "{} sorted into {} ({} records, {} values)",
            input.display(),
            output.display(),
            stats.records,
            stats.values
        ),
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    }
}

fn merge(args: &clap::ArgMatches) {
    let dir = path::Path::new(args.value_of("dir").expect("value is required"));
    let mask = args.value_of("mask").expect("value has a default");
    let output = args.value_of("output").expect("value is required");

    let paths = match find_partitions(dir, mask) {
        Ok(paths) if !paths.is_empty() => paths,
        Ok(_) => {
            log::error!("files by mask '{}' aren't found in directory {}", mask, dir.display());
            process::exit(1);
        }
        Err(err) => {
            log::error!("partitions listing error: {}", err);
            process::exit(1);
        }
    };

    let output_stream = match fs::File::create(output) {
        Ok(file) => io::BufWriter::new(file),
        Err(err) => {
            log::error!("output file creation error: {}", err);
            process::exit(1);
        }
    };

    let sorter = build_sorter(init_sorter_builder(args));
    match sorter.merge_partitions(&paths, output_stream, args.is_present("delete_partitions")) {
        Ok(stats) => log::info!("{} partitions merged ({} records)", paths.len(), stats.records),
        Err(err) => {
            log::error!("partitions merging error: {}", err);
            process::exit(1);
        }
    }
}

fn init_sorter_builder(args: &clap::ArgMatches) -> ExternalSorterBuilder {
    let started = Instant::now();
    let mut sorter_builder = ExternalSorterBuilder::new().with_progress(move |progress| report(progress, started));

    if args.is_present("threads") {
        sorter_builder = sorter_builder.with_threads_number(args.value_of_t_or_exit("threads"));
    }

    return sorter_builder;
}

fn build_sorter(sorter_builder: ExternalSorterBuilder) -> ExternalSorter {
    match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    }
}

fn report(progress: Progress, started: Instant) {
    let phase = match progress.phase {
        Phase::Splitting => "splitting",
        Phase::Merging => "merging",
    };
    let megabytes = progress.processed as f64 / MEGABYTE;
    let speed = megabytes / started.elapsed().as_secs_f64().max(f64::EPSILON);

    match progress.total {
        Some(total) if total > 0 => log::info!(
            "{} {:.0}% (total {:.0} MB, {:.0} MB/s)",
            phase,
            progress.processed as f64 / total as f64 * 100.0,
            megabytes,
            speed
        ),
        _ => log::info!("{} (total {:.0} MB, {:.0} MB/s)", phase, megabytes, speed),
    }
}

fn parse_size(value: &str) -> u64 {
    value.parse::<ByteSize>().expect("value is pre-validated").as_u64()
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

fn size_arg(name: &'static str, long: &'static str, help: &'static str) -> clap::Arg<'static> {
    clap::Arg::new(name)
        .long(long)
        .help(help)
        .takes_value(true)
        .validator(|v| match v.parse::<ByteSize>() {
            Ok(_) => Ok(()),
            Err(err) => Err(format!("size format incorrect: {}", err)),
        })
}

fn threads_arg() -> clap::Arg<'static> {
    clap::Arg::new("threads")
        .short('t')
        .long("threads")
        .help("number of threads to use for parallel sorting")
        .takes_value(true)
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("bigsort")
        .about("sorts '<number>. <value>' records grouped by value")
        .subcommand_required(true)
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .subcommand(
            clap::App::new("sort")
                .about("sort a records file")
                .arg(
                    clap::Arg::new("input")
                        .short('i')
                        .long("input")
                        .help("file to be sorted")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("result file")
                        .required(true)
                        .takes_value(true),
                )
                .arg(threads_arg())
                .arg(
                    clap::Arg::new("tmp_dir")
                        .short('d')
                        .long("tmp-dir")
                        .help("directory to be used to store partitions")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("buffer_entries")
                        .long("buffer-entries")
                        .help("number of distinct values per partition")
                        .takes_value(true),
                )
                .arg(size_arg("arena_size", "arena-size", "memory reserved for values of a partition"))
                .arg(size_arg(
                    "small_threshold",
                    "small-threshold",
                    "input size starting from which partitions are used",
                ))
                .arg(
                    clap::Arg::new("keep_partitions")
                        .long("keep-partitions")
                        .help("keep partition files in the temporary directory")
                        .requires("tmp_dir"),
                ),
        )
        .subcommand(
            clap::App::new("merge")
                .about("merge existing partition files")
                .arg(
                    clap::Arg::new("dir")
                        .short('d')
                        .long("dir")
                        .help("directory with partitions")
                        .takes_value(true)
                        .default_value("."),
                )
                .arg(
                    clap::Arg::new("mask")
                        .short('m')
                        .long("mask")
                        .help("partition file name mask")
                        .takes_value(true)
                        .default_value(PARTITION_FILE_PATTERN),
                )
                .arg(
                    clap::Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("result file")
                        .required(true)
                        .takes_value(true),
                )
                .arg(threads_arg())
                .arg(
                    clap::Arg::new("delete_partitions")
                        .long("delete-partitions")
                        .help("delete partitions after merge"),
                ),
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

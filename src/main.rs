use clap::Parser;
use lib::{OutputFormat, PipelineConfig, SimpleLogger, TimeUnit, run_pipeline};
use log::{debug, error};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

static LOGGER: SimpleLogger = SimpleLogger;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Raw postings CSV file
    #[arg(short, long, default_value = lib::structs::DEFAULT_INPUT_PATH)]
    input_file: PathBuf,

    /// Directory receiving the output files (created if absent, files overwritten)
    #[arg(short, long, default_value = lib::structs::DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Number of leading rows written to the cleaned sample
    #[arg(long, default_value_t = lib::structs::DEFAULT_SAMPLE_SIZE)]
    sample_size: usize,

    /// Unit of the epoch values in listed_time
    #[arg(long, default_value = "seconds")]
    time_unit: TimeUnit,

    /// Extra output formats besides CSV (e.g., json,parquet)
    #[arg(short, long, value_delimiter = ',')]
    format: Vec<OutputFormat>,

    /// Log level for output
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn main() -> ExitCode {
    let total_start = Instant::now();
    if log::set_logger(&LOGGER).is_err() {
        eprintln!("Logger was already initialized");
    }

    let args = Args::parse();
    if args.debug {
        log::set_max_level(log::LevelFilter::Debug);
    } else {
        log::set_max_level(log::LevelFilter::Info);
    }

    println!("Job Postings Pipeline");
    debug!(
        "Input file: {} | Output dir: {} | Sample size: {}",
        args.input_file.display(),
        args.output_dir.display(),
        args.sample_size
    );
    debug!("Time unit: {:?} | Formats: {:?}", args.time_unit, args.format);

    let config = PipelineConfig {
        input_path: args.input_file,
        output_dir: args.output_dir,
        sample_size: args.sample_size,
        time_unit: args.time_unit,
        formats: args.format,
    };

    match run_pipeline(&config) {
        Ok(report) => {
            println!(
                "\nProcessed {} postings | Wrote {} files to {}",
                report.raw_rows,
                report.written.len(),
                config.output_dir.display()
            );
            println!("Pipeline completed successfully in {:.2?}", total_start.elapsed());
            ExitCode::SUCCESS
        }
        Err(failure) => {
            error!("{}", failure);
            ExitCode::FAILURE
        }
    }
}

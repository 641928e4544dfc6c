//! Full Score CLI - Command-line interface for the BEAT edge interpreter
//!
//! Commands:
//! - decode: Decode BEAT streams into events
//! - classify: Run the bot/human classifier over streams
//! - ping: Answer a live ping for a cookie header
//! - reassemble: Rebuild archived journeys from flushed batches
//! - report: Build a daily archive report from log entries
//! - validate: Strictly validate session and movement records
//! - doctor: Diagnose configuration

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use fullscore::beat::decode;
use fullscore::config::FullScoreConfig;
use fullscore::edge::{
    classify_stream, day_start_ms, ndjson_report, reassemble, respond_to_ping, DailyReport,
    LogEntry,
};
use fullscore::record::{parse_slot_name, MovementRecord, SessionRecord};
use fullscore::rhythm::MOVEMENT_COOKIE;
use fullscore::{ScoreError, FULLSCORE_VERSION, PRODUCER_NAME};

/// Full Score - BEAT codec and edge interpreter
#[derive(Parser)]
#[command(name = "fullscore")]
#[command(author = "Aidgn")]
#[command(version = FULLSCORE_VERSION)]
#[command(about = "Decode, classify and archive BEAT streams", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode BEAT streams (one per line) into JSON events
    Decode {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
    },

    /// Classify BEAT streams (one per line)
    Classify {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Configuration file (FullScoreConfig JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Answer a live ping for a raw Cookie header
    Ping {
        /// Cookie header value
        cookie: String,

        /// Configuration file (FullScoreConfig JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Reassemble flushed batch bodies (one per line) into archive lines
    Reassemble {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Configuration file (FullScoreConfig JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Build the daily report from NDJSON log entries ({"timestamp", "message"})
    Report {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Local date of the report (YYYY-MM-DD)
        #[arg(long)]
        date: String,

        /// Local timezone offset in hours
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        gmt: i32,

        /// Report format
        #[arg(long, default_value = "beat")]
        format: ReportFormat,
    },

    /// Validate session and movement records (one `name=value` per line)
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration
    Doctor {
        /// Configuration file to check
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum ReportFormat {
    /// Markdown report with overview and hourly sessions
    Beat,
    /// JSON lines only
    Ndjson,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), ScoreCliError> {
    match cli.command {
        Commands::Decode { input } => cmd_decode(&input),
        Commands::Classify { input, config } => cmd_classify(&input, config.as_deref()),
        Commands::Ping { cookie, config } => cmd_ping(&cookie, config.as_deref()),
        Commands::Reassemble { input, config } => cmd_reassemble(&input, config.as_deref()),
        Commands::Report {
            input,
            output,
            date,
            gmt,
            format,
        } => cmd_report(&input, &output, &date, gmt, format),
        Commands::Validate { input, json } => cmd_validate(&input, json),
        Commands::Doctor { config, json } => cmd_doctor(config.as_deref(), json),
    }
}

fn read_input(input: &Path) -> Result<String, ScoreCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn non_empty_lines(data: &str) -> impl Iterator<Item = &str> {
    data.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn load_config(path: Option<&Path>) -> Result<FullScoreConfig, ScoreCliError> {
    match path {
        Some(path) => Ok(FullScoreConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(FullScoreConfig::default()),
    }
}

fn cmd_decode(input: &Path) -> Result<(), ScoreCliError> {
    let data = read_input(input)?;
    let mut any = false;
    for stream in non_empty_lines(&data) {
        println!("{}", serde_json::to_string(&decode(stream))?);
        any = true;
    }
    if !any {
        return Err(ScoreCliError::NoInput);
    }
    Ok(())
}

fn cmd_classify(input: &Path, config: Option<&Path>) -> Result<(), ScoreCliError> {
    let config = load_config(config)?;
    let data = read_input(input)?;
    let edge = &config.edge;
    let mut any = false;
    for stream in non_empty_lines(&data) {
        let classification = classify_stream(stream, edge.resolution_ms, &edge.classifier);
        println!("{}", serde_json::to_string(&classification)?);
        any = true;
    }
    if !any {
        return Err(ScoreCliError::NoInput);
    }
    Ok(())
}

fn cmd_ping(cookie: &str, config: Option<&Path>) -> Result<(), ScoreCliError> {
    let config = load_config(config)?;
    let response = respond_to_ping(cookie, &config.edge);
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

fn cmd_reassemble(input: &Path, config: Option<&Path>) -> Result<(), ScoreCliError> {
    let config = load_config(config)?;
    let data = read_input(input)?;
    let mut archived = 0;
    for body in non_empty_lines(&data) {
        if let Some(journey) = reassemble(body, &config.edge) {
            println!("{}", journey.render(&config.edge.archiving)?);
            archived += 1;
        }
    }
    if archived == 0 {
        return Err(ScoreCliError::Score(ScoreError::EmptyBatch(
            "no journey passed the archiving filters".to_string(),
        )));
    }
    Ok(())
}

fn cmd_report(
    input: &Path,
    output: &Path,
    date: &str,
    gmt: i32,
    format: ReportFormat,
) -> Result<(), ScoreCliError> {
    let start = day_start_ms(date, gmt)?;
    let data = read_input(input)?;
    let entries = non_empty_lines(&data)
        .map(serde_json::from_str::<LogEntry>)
        .collect::<Result<Vec<_>, _>>()?;

    let content = match format {
        ReportFormat::Beat => DailyReport::build(date, start, &entries).to_markdown(),
        ReportFormat::Ndjson => ndjson_report(&entries).0,
    };

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(output, content)?;
    }
    Ok(())
}

fn validate_line(line: &str) -> Result<(), ScoreError> {
    let (name, value) = line
        .split_once('=')
        .ok_or_else(|| ScoreError::MalformedRecord(format!("'{line}' is not name=value")))?;
    if name == MOVEMENT_COOKIE {
        value.parse::<MovementRecord>()?;
    } else if parse_slot_name(name).is_some() {
        value.parse::<SessionRecord>()?;
    } else {
        return Err(ScoreError::MalformedRecord(format!("unknown cookie '{name}'")));
    }
    Ok(())
}

fn cmd_validate(input: &Path, json: bool) -> Result<(), ScoreCliError> {
    let data = read_input(input)?;
    let lines: Vec<&str> = non_empty_lines(&data).collect();
    let errors: Vec<ValidationErrorDetail> = lines
        .iter()
        .enumerate()
        .filter_map(|(index, line)| {
            validate_line(line).err().map(|e| ValidationErrorDetail {
                index,
                error: e.to_string(),
            })
        })
        .collect();

    let report = ValidationReport {
        total_records: lines.len(),
        valid_records: lines.len() - errors.len(),
        invalid_records: errors.len(),
        errors,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total records:   {}", report.total_records);
        println!("Valid records:   {}", report.valid_records);
        println!("Invalid records: {}", report.invalid_records);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - Line {}: {}", err.index + 1, err.error);
            }
        }
    }

    if report.invalid_records > 0 {
        Err(ScoreCliError::ValidationFailed(report.invalid_records))
    } else {
        Ok(())
    }
}

fn cmd_doctor(config: Option<&Path>, json: bool) -> Result<(), ScoreCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "fullscore_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Full Score version {}", FULLSCORE_VERSION),
    });

    let loaded = match config {
        Some(path) if !path.exists() => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Warning,
                message: "Config file does not exist, using defaults".to_string(),
            });
            FullScoreConfig::default()
        }
        Some(path) => match fs::read_to_string(path)
            .map_err(ScoreCliError::from)
            .and_then(|content| Ok(FullScoreConfig::from_json(&content)?))
        {
            Ok(loaded) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Ok,
                    message: "Config file valid".to_string(),
                });
                loaded
            }
            Err(e) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: CliError::from(e).message,
                });
                FullScoreConfig::default()
            }
        },
        None => FullScoreConfig::default(),
    };

    checks.push(DoctorCheck {
        name: "resolution".to_string(),
        status: if loaded.beat.resolution_ms == loaded.edge.resolution_ms {
            CheckStatus::Ok
        } else {
            CheckStatus::Error
        },
        message: format!(
            "Client {} ms, edge {} ms",
            loaded.beat.resolution_ms, loaded.edge.resolution_ms
        ),
    });

    checks.push(DoctorCheck {
        name: "slots".to_string(),
        status: CheckStatus::Ok,
        message: format!(
            "{} slots of {} bytes",
            loaded.rhythm.max_slots, loaded.rhythm.capacity_bytes
        ),
    });

    let fits = (loaded.rhythm.max_slots as usize + 1) * loaded.rhythm.capacity_bytes
        < loaded.edge.header_limit;
    checks.push(DoctorCheck {
        name: "header_limit".to_string(),
        status: if fits {
            CheckStatus::Ok
        } else {
            CheckStatus::Warning
        },
        message: format!(
            "Edge ignores Cookie headers from {} bytes",
            loaded.edge.header_limit
        ),
    });

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (batch input ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: FULLSCORE_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Full Score Doctor Report");
        println!("========================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(ScoreCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

#[derive(Debug)]
enum ScoreCliError {
    Io(io::Error),
    Score(ScoreError),
    Json(serde_json::Error),
    NoInput,
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for ScoreCliError {
    fn from(e: io::Error) -> Self {
        ScoreCliError::Io(e)
    }
}

impl From<ScoreError> for ScoreCliError {
    fn from(e: ScoreError) -> Self {
        ScoreCliError::Score(e)
    }
}

impl From<serde_json::Error> for ScoreCliError {
    fn from(e: serde_json::Error) -> Self {
        ScoreCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<ScoreCliError> for CliError {
    fn from(e: ScoreCliError) -> Self {
        match e {
            ScoreCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            ScoreCliError::Score(ScoreError::DateParseError(msg)) => CliError {
                code: "DATE_ERROR".to_string(),
                message: msg,
                hint: Some("Use the YYYY-MM-DD format".to_string()),
            },
            ScoreCliError::Score(ScoreError::InvalidConfig(msg)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'fullscore doctor --config <file>' for details".to_string()),
            },
            ScoreCliError::Score(e) => CliError {
                code: "SCORE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            ScoreCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            ScoreCliError::NoInput => CliError {
                code: "NO_INPUT".to_string(),
                message: "No streams found in input".to_string(),
                hint: Some("Ensure input is not empty".to_string()),
            },
            ScoreCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} records failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            ScoreCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_records: usize,
    valid_records: usize,
    invalid_records: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

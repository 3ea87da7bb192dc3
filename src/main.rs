use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;

use sedation_pkpd::config::RunConfig;
use sedation_pkpd::dosing::{DoseEvent, DoseSchedule};
use sedation_pkpd::error::PKError;
use sedation_pkpd::induction::InductionSimulator;
use sedation_pkpd::patient::Patient;
use sedation_pkpd::protocol::{self, ProtocolRequest};
use sedation_pkpd::{monitoring, output};

#[derive(Parser)]
#[command(name = "pk_sim")]
#[command(about = "Sedative-hypnotic IV dosing PK/PD simulator and protocol optimizer")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Run configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live tick-driven induction simulator for a fixed duration.
    Induct {
        /// Patient JSON file
        #[arg(short, long)]
        patient: PathBuf,
        #[arg(long)]
        bolus_mg: f64,
        #[arg(long, default_value = "0.0")]
        continuous_mg_per_hr: f64,
        #[arg(long, default_value = "10.0")]
        duration_min: f64,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Integrate a full dose schedule and export a concentration-time CSV.
    Monitor {
        #[arg(short, long)]
        patient: PathBuf,
        /// Dose schedule file: a JSON array of dose events, or abbreviated
        /// bedside shorthand ("BOLUS 140 AT 0") when `--notation` is set.
        #[arg(short, long)]
        doses: PathBuf,
        /// Parse `--doses` as abbreviated dosing shorthand instead of JSON
        #[arg(long)]
        notation: bool,
        #[arg(long)]
        horizon_min: Option<f64>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Search for the step-down infusion protocol that best holds a target
    /// effect-site concentration.
    Protocol {
        #[arg(short, long)]
        patient: PathBuf,
        #[arg(long)]
        target_ce: f64,
        #[arg(long)]
        bolus_mg: f64,
        #[arg(long, default_value = "20.0")]
        target_reach_time_min: f64,
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn load_patient(path: &PathBuf) -> Result<Patient, PKError> {
    let content = std::fs::read_to_string(path)?;
    let patient: Patient = serde_json::from_str(&content)?;
    patient.validate()?;
    Ok(patient)
}

fn main() -> Result<(), PKError> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let run_config = match &cli.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    if cli.config.is_some() {
        info!("loaded run configuration from {:?}", cli.config);
    }

    match cli.command {
        Command::Induct {
            patient,
            bolus_mg,
            continuous_mg_per_hr,
            duration_min,
            output,
        } => {
            let patient = load_patient(&patient)?;
            let mut sim = InductionSimulator::new();
            sim.start(patient, bolus_mg, continuous_mg_per_hr)?;

            let ticks = (duration_min / sedation_pkpd::induction::SIMULATED_DT_MIN).round() as u64;
            let mut last = None;
            for _ in 0..ticks {
                last = Some(sim.tick()?);
            }

            std::fs::create_dir_all(&output)?;
            if let Some(observable) = last {
                let file = std::fs::File::create(output.join("induction_final.json"))?;
                serde_json::to_writer_pretty(file, &observable)?;
                info!(
                    "induction finished at {} (Ce={:.3} ug/mL, BIS={:.1})",
                    observable.elapsed_string(),
                    observable.ce,
                    observable.bis
                );
            }
        }
        Command::Monitor {
            patient,
            doses,
            notation,
            horizon_min,
            output,
        } => {
            let patient = load_patient(&patient)?;
            let schedule = if notation {
                sedation_pkpd::config::clinical_notation::parse_file(&doses)?
            } else {
                let dose_events: Vec<DoseEvent> = serde_json::from_str(&std::fs::read_to_string(&doses)?)?;
                let mut schedule = DoseSchedule::new();
                for event in dose_events {
                    schedule.add(event)?;
                }
                schedule
            };

            let horizon = horizon_min.or(run_config.monitoring_horizon_min);
            let result = monitoring::simulate(
                &patient,
                &schedule,
                horizon,
                run_config.integration_method,
            )?;
            output::save_monitoring_results(&result, &patient, &output)?;
            info!(
                "monitoring run complete: max plasma={:.3}, max Ce={:.3}, min BIS={:.1}",
                result.max_plasma, result.max_ce, result.min_bis
            );
        }
        Command::Protocol {
            patient,
            target_ce,
            bolus_mg,
            target_reach_time_min,
            output,
        } => {
            let patient = load_patient(&patient)?;
            let settings = run_config.protocol_overrides.apply(target_ce)?;
            let request = ProtocolRequest {
                bolus_mg,
                target_reach_time_min,
            };
            let result = protocol::run(&patient, request, &settings)?;
            output::save_protocol_results(&result, &output)?;
            output::generate_protocol_report(&result, &output)?;
            info!(
                "protocol optimized: initial rate={:.1} mg/hr, overall score={:.1}",
                result.optimal_initial_rate_mg_per_hr, result.performance.overall_score
            );
        }
    }

    Ok(())
}

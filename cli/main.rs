#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser, Subcommand};
use csv::WriterBuilder;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use ndarray::Array2;
use rayon::prelude::*;
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use pcmfit::config::{self, Study};
use pcmfit::crossval::{self, CrossvalProgress};
use pcmfit::data;
use pcmfit::preprocess::{self, SubjectStats};
use pcmfit::second_moment;

type CliResult = Result<(), Box<dyn Error + Send + Sync>>;

#[derive(Parser)]
#[command(
    name = "pcmfit",
    about = "Crossvalidated pattern component modelling",
    long_about = "Estimates crossvalidated second-moment matrices of activity patterns and \
                 compares pattern component models by leave-one-subject-out likelihood."
)]
struct Cli {
    /// Number of worker threads (defaults to all cores)
    #[arg(long, global = true, value_name = "N")]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate the crossvalidated second moment of one subject
    #[command(about = "Estimate a crossvalidated G matrix")]
    Estimate {
        /// Subject TSV with partition, condition and channel columns
        #[arg(value_name = "DATA_PATH")]
        data: PathBuf,

        /// Also write the covariance of the partition estimates
        #[arg(long)]
        covariance: bool,

        /// Output TSV (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Leave-one-subject-out crossvalidation of every model in a study
    #[command(about = "Crossvalidate models across subjects")]
    Crossval {
        /// Study TOML file
        #[arg(value_name = "STUDY_PATH")]
        study: PathBuf,

        /// Group-fit parameters used as starting values (from `pcmfit group`)
        #[arg(long)]
        group_theta: Option<PathBuf>,

        /// Output TSV report
        #[arg(long, default_value = "crossval.tsv")]
        out: PathBuf,
    },

    /// Fit every model to all subjects at once
    #[command(about = "Fit models to the whole group")]
    Group {
        /// Study TOML file
        #[arg(value_name = "STUDY_PATH")]
        study: PathBuf,

        /// Output TOML with one parameter vector per model
        #[arg(long, default_value = "group_theta.toml")]
        out: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { threads, command } = Cli::parse();

    if let Some(n) = threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(n).build_global() {
            eprintln!("Error: failed to initialize thread pool: {e}");
            process::exit(1);
        }
    }

    let result = match command {
        Some(Commands::Estimate {
            data,
            covariance,
            out,
        }) => run_estimate(&data, covariance, out.as_deref()),
        Some(Commands::Crossval {
            study,
            group_theta,
            out,
        }) => run_crossval(&study, group_theta.as_deref(), &out),
        Some(Commands::Group { study, out }) => run_group(&study, &out),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_estimate(path: &Path, covariance: bool, out: Option<&Path>) -> CliResult {
    let subject = data::load_subject("subject", path)?;
    let estimate = if covariance {
        second_moment::estimate_g_crossval_with_covariance(
            subject.activity.view(),
            &subject.partition,
            &subject.conditions,
            None,
        )?
    } else {
        second_moment::estimate_g_crossval(
            subject.activity.view(),
            &subject.partition,
            &subject.conditions,
            None,
        )?
    };
    log::info!(
        "Estimated {}x{} G from {} partitions.",
        estimate.g.nrows(),
        estimate.g.ncols(),
        estimate.num_partitions
    );

    let mut blocks = vec![("G", &estimate.g)];
    if let Some(sig) = &estimate.sig {
        blocks.push(("Sig", sig));
    }
    match out {
        Some(path) => write_matrices(WriterBuilder::new().delimiter(b'\t').from_path(path)?, &blocks)?,
        None => write_matrices(
            WriterBuilder::new()
                .delimiter(b'\t')
                .from_writer(std::io::stdout()),
            &blocks,
        )?,
    }
    Ok(())
}

/// Writes labelled matrices as `matrix, row, c1..cK` rows.
fn write_matrices<W: std::io::Write>(
    mut wtr: csv::Writer<W>,
    blocks: &[(&str, &Array2<f64>)],
) -> CliResult {
    let k = blocks.first().map_or(0, |(_, m)| m.ncols());
    let mut header = vec!["matrix".to_string(), "row".to_string()];
    header.extend((1..=k).map(|j| format!("c{j}")));
    wtr.write_record(&header)?;
    for (name, m) in blocks {
        for (i, row) in m.rows().into_iter().enumerate() {
            let mut record = vec![name.to_string(), (i + 1).to_string()];
            record.extend(row.iter().map(|v| format!("{v:.12}")));
            wtr.write_record(&record)?;
        }
    }
    wtr.flush()?;
    Ok(())
}

fn load_subjects(study: &Study) -> Result<Vec<SubjectStats>, Box<dyn Error + Send + Sync>> {
    let start = Instant::now();
    let subjects = study
        .subjects
        .par_iter()
        .map(|entry| -> Result<SubjectStats, Box<dyn Error + Send + Sync>> {
            let raw = data::load_subject(&entry.id, &entry.data)?;
            Ok(preprocess::preprocess_subject(&raw)?)
        })
        .collect::<Result<Vec<_>, _>>()?;
    log::info!(
        "Preprocessed {} subjects in {:.2?}.",
        subjects.len(),
        start.elapsed()
    );
    Ok(subjects)
}

fn run_crossval(study_path: &Path, group_theta: Option<&Path>, out: &Path) -> CliResult {
    let mut study = config::load_study(study_path)?;
    if let Some(path) = group_theta {
        study.config.group_theta = Some(config::load_group_theta(path, &study.models)?);
    }
    let subjects = load_subjects(&study)?;

    let progress = BarProgress::new();
    let report = crossval::fit_crossval(&subjects, &study.models, &study.config, &progress)?;
    report.write_tsv(out)?;

    let likelihoods = report.likelihood_matrix();
    println!("subject\t{}", report.models.iter().join("\t"));
    for (subject, row) in report.subjects.iter().zip(likelihoods.rows()) {
        println!(
            "{}\t{}",
            subject,
            row.iter().map(|v| format!("{v:.4}")).join("\t")
        );
    }
    println!("Report written to '{}'.", out.display());
    Ok(())
}

fn run_group(study_path: &Path, out: &Path) -> CliResult {
    let study = config::load_study(study_path)?;
    let subjects = load_subjects(&study)?;
    let fits = crossval::fit_group(&subjects, &study.models, &study.config)?;

    let names: Vec<String> = fits.iter().map(|f| f.model.clone()).collect();
    let thetas: Vec<_> = fits.iter().map(|f| f.theta.clone()).collect();
    config::save_group_theta(out, &names, &thetas)?;
    for fit in &fits {
        println!(
            "{}\tlog-likelihood {:.4}\t{} iterations",
            fit.model, fit.likelihood, fit.iterations
        );
    }
    println!("Group parameters written to '{}'.", out.display());
    Ok(())
}

/// Progress bar over the (subject, model) grid.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl CrossvalProgress for BarProgress {
    fn on_start(&self, total_cells: usize) {
        self.bar.set_length(total_cells as u64);
    }

    fn on_cell_finished(&self, subject: &str, model: &str) {
        self.bar.set_message(format!("{subject} / {model}"));
        self.bar.inc(1);
    }

    fn on_finish(&self) {
        self.bar.finish_with_message("done");
    }
}

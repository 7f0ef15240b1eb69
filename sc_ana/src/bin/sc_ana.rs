//! sc_ana
#![deny(missing_docs)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Builder;
use log::{info, LevelFilter};
use sc_ana::io::export_analysis;
use sc_ana::steps::DatasetMap;
use sc_ana::{
    create_analysis, inspect_container, load_analysis, retrieve_parameters, run_analysis,
    save_analysis, Analysis, AnalysisParameters, NoopObserver, Session,
};
use sc_store::ExtractToDirectory;
use sc_types::mtx::MatrixMarketDataset;
use sc_types::DatasetRegistry;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// A dataset given as `NAME=MATRIX[,FEATURES[,BARCODES]]`.
#[derive(Clone, Debug)]
struct DatasetArg {
    name: String,
    matrix: PathBuf,
    features: Option<PathBuf>,
    barcodes: Option<PathBuf>,
}

impl FromStr for DatasetArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, files) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=MATRIX[,FEATURES[,BARCODES]], got {s:?}"))?;
        let mut files = files.split(',').map(PathBuf::from);
        let matrix = files
            .next()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| format!("no matrix given for {name:?}"))?;
        Ok(DatasetArg {
            name: name.to_string(),
            matrix,
            features: files.next(),
            barcodes: files.next(),
        })
    }
}

#[derive(Debug, Parser)]
#[clap(version, about = "Incremental single-cell analysis")]
enum Args {
    /// Analyse Matrix Market datasets from scratch.
    Run {
        /// Input datasets; several become batches.
        #[clap(long = "dataset", required = true)]
        datasets: Vec<DatasetArg>,
        /// TOML parameter file; defaults when omitted.
        #[clap(long)]
        params: Option<PathBuf>,
        /// Write the analysis state here.
        #[clap(long)]
        save: Option<PathBuf>,
        /// Copy the input files into the saved state.
        #[clap(long)]
        embed: bool,
        /// Export results as CSV into this directory.
        #[clap(long)]
        export: Option<PathBuf>,
        /// Worker threads; one per core when omitted.
        #[clap(long)]
        threads: Option<usize>,
    },
    /// Load a saved analysis and run it again with new parameters.
    Rerun {
        /// Saved analysis.
        state: PathBuf,
        /// TOML parameter file; the saved parameters when omitted.
        #[clap(long)]
        params: Option<PathBuf>,
        /// Where embedded input files are extracted.
        #[clap(long, default_value = "sc_ana_files")]
        extract_to: PathBuf,
        /// Write the updated state here.
        #[clap(long)]
        save: Option<PathBuf>,
        /// Copy the input files into the saved state.
        #[clap(long)]
        embed: bool,
        /// Export results as CSV into this directory.
        #[clap(long)]
        export: Option<PathBuf>,
        /// Worker threads; one per core when omitted.
        #[clap(long)]
        threads: Option<usize>,
    },
    /// Print the parameters as TOML: the defaults, a parameter file, or
    /// those of a saved analysis.
    Params {
        /// TOML parameter file.
        #[clap(long, conflicts_with = "state")]
        file: Option<PathBuf>,
        /// Saved analysis.
        #[clap(long)]
        state: Option<PathBuf>,
    },
    /// Summarize a saved analysis without restoring it.
    Inspect {
        /// Saved analysis.
        state: PathBuf,
    },
    /// Export the results of a saved analysis as CSV.
    Export {
        /// Saved analysis.
        state: PathBuf,
        /// Output directory.
        #[clap(long)]
        out: PathBuf,
        /// Where embedded input files are extracted.
        #[clap(long, default_value = "sc_ana_files")]
        extract_to: PathBuf,
    },
}

fn init_logging() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn session(threads: Option<usize>) -> Result<Arc<Session>> {
    let mut builder = Session::builder();
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    Ok(Arc::new(builder.build()?))
}

fn datasets(args: &[DatasetArg]) -> Result<DatasetMap> {
    let mut map = DatasetMap::new();
    for arg in args {
        let mut dataset = MatrixMarketDataset::new(&arg.matrix);
        if let Some(features) = &arg.features {
            dataset = dataset.with_features(features);
        }
        if let Some(barcodes) = &arg.barcodes {
            dataset = dataset.with_annotations(barcodes);
        }
        if map.insert(arg.name.clone(), Arc::new(dataset)).is_some() {
            bail!("dataset {:?} given twice", arg.name);
        }
    }
    Ok(map)
}

fn load(state: &Path, session: Arc<Session>, extract_to: &Path) -> Result<Analysis> {
    let mut resolver = ExtractToDirectory::new(extract_to);
    load_analysis(state, session, &DatasetRegistry::default(), &mut resolver)
        .with_context(|| format!("failed to load {}", state.display()))
}

fn finish(analysis: &Analysis, save: Option<&Path>, embed: bool, export: Option<&Path>) -> Result<()> {
    if let Some(path) = save {
        save_analysis(analysis, path, embed)?;
    }
    if let Some(dir) = export {
        export_analysis(analysis, dir)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    match args {
        Args::Run {
            datasets: dataset_args,
            params,
            save,
            embed,
            export,
            threads,
        } => {
            let params = AnalysisParameters::load(params.as_deref())?;
            let datasets = datasets(&dataset_args)?;
            let mut analysis = create_analysis(session(threads)?)?;
            run_analysis(&mut analysis, Some(&datasets), &params, &NoopObserver)?;
            info!("analysis finished with {} clusters", analysis.choose_clustering.num_clusters());
            finish(&analysis, save.as_deref(), embed, export.as_deref())?;
        }
        Args::Rerun {
            state,
            params,
            extract_to,
            save,
            embed,
            export,
            threads,
        } => {
            let mut analysis = load(&state, session(threads)?, &extract_to)?;
            let params = match params {
                Some(path) => AnalysisParameters::from_file(&path)?,
                None => retrieve_parameters(&analysis),
            };
            run_analysis(&mut analysis, None, &params, &NoopObserver)?;
            info!("recomputed {} steps", analysis.changed_steps().len());
            finish(&analysis, save.as_deref(), embed, export.as_deref())?;
        }
        Args::Params { file, state } => {
            let params = match state {
                Some(state) => {
                    let tmp = std::env::temp_dir().join("sc_ana_params");
                    retrieve_parameters(&load(&state, session(Some(1))?, &tmp)?)
                }
                None => AnalysisParameters::load(file.as_deref())?,
            };
            print!("{}", params.to_toml_string()?);
        }
        Args::Inspect { state } => {
            let summary = inspect_container(&state)?;
            println!("version: {}", summary.version);
            println!("embedded files: {}", summary.embedded);
            for (step, has_results) in &summary.steps {
                println!("{step:<24}{}", if *has_results { "results" } else { "-" });
            }
        }
        Args::Export {
            state,
            out,
            extract_to,
        } => {
            let analysis = load(&state, session(None)?, &extract_to)?;
            export_analysis(&analysis, &out)?;
        }
    }

    Ok(())
}

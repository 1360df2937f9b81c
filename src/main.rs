// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Error, Result};
use clap::Parser;
use env_logger;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use num_cpus;
use rayon::prelude::*;
use std::{fs, path::PathBuf, time::Instant};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting popstruct_plot with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    // --- 1. Load Input Tables ---
    info!("Loading PC scores from {}", cli_args.scores.display());
    let score_table = tables::load_scores(&cli_args.scores)?;
    info!(
        "Loaded {} sample(s) x {} PC column(s) (PC{} through PC{}).",
        score_table.sample_ids.len(),
        score_table.pc_numbers.len(),
        score_table.pc_numbers.first().copied().unwrap_or(0),
        score_table.pc_numbers.last().copied().unwrap_or(0),
    );

    info!("Loading eigenvalues from {}", cli_args.eigenvalues.display());
    let eigenvalues = tables::load_eigenvalues(&cli_args.eigenvalues)?;
    let pve = tables::percent_variance_explained(&eigenvalues);
    debug!(
        "Percent variance explained (first 5): {:?}",
        pve.iter().take(5).collect::<Vec<_>>()
    );
    let max_pc_in_scores = score_table.pc_numbers.last().copied().unwrap_or(0);
    if eigenvalues.len() != max_pc_in_scores {
        warn!(
            "Eigenvalue count ({}) does not match the highest score column (PC{}). \
             Axis percentages are only available for PCs with an eigenvalue.",
            eigenvalues.len(),
            max_pc_in_scores
        );
    }

    info!("Loading sample metadata from {}", cli_args.metadata.display());
    let metadata = tables::load_metadata(&cli_args.metadata)?;
    info!("Loaded metadata for {} sample(s).", metadata.len());

    // --- 2. Merge Scores with Location Groups ---
    let merged = grouping::merge(&score_table, &metadata);
    if merged.groups.is_empty() {
        return Err(anyhow!(
            "No samples matched between the score table and the metadata; nothing to plot."
        ));
    }
    if merged.unmatched > 0 {
        warn!(
            "{} of {} sample(s) had no metadata match and will not appear in any plotted group.",
            merged.unmatched, merged.total
        );
    }
    info!(
        "Merged {} sample(s) into {} location group(s).",
        merged.total - merged.unmatched,
        merged.groups.len()
    );

    // --- 3. Resolve Requested PC Pairs ---
    let pairs = cli::parse_pairs(&cli_args.pairs)?;
    for &(a, b) in &pairs {
        for k in [a, b] {
            if score_table.column_for_pc(k).is_none() {
                return Err(anyhow!(
                    "PC{} was requested in --pairs, but the score table has no PC{} column.",
                    k,
                    k
                ));
            }
            if k > pve.len() {
                return Err(anyhow!(
                    "PC{} was requested in --pairs, but only {} eigenvalue(s) were provided.",
                    k,
                    pve.len()
                ));
            }
        }
    }
    let mut unique_pairs: Vec<(usize, usize)> = Vec::new();
    for &pair in &pairs {
        if unique_pairs.contains(&pair) {
            warn!(
                "Duplicate PC pair {}:{} in --pairs; rendering it once.",
                pair.0, pair.1
            );
        } else {
            unique_pairs.push(pair);
        }
    }

    let output_prefix_path = PathBuf::from(&cli_args.output_prefix);
    if let Some(parent) = output_prefix_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                anyhow!("Failed to create output directory {}: {}", parent.display(), e)
            })?;
            info!("Created output directory: {}", parent.display());
        }
    }

    let plots: Vec<plotting::ScatterPlot> = unique_pairs
        .iter()
        .map(|&(a, b)| plotting::ScatterPlot {
            pc_x: a,
            pc_y: b,
            pve_x: pve[a - 1],
            pve_y: pve[b - 1],
            title: cli_args.title.clone(),
            width: cli_args.width,
            height: cli_args.height,
            output_path: PathBuf::from(format!(
                "{}.PC{}_PC{}.png",
                cli_args.output_prefix, a, b
            )),
        })
        .collect();

    // --- 4. Render Plots ---
    info!("Rendering {} plot(s)...", plots.len());
    let pb_style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} plots ({percent}%) ETA: {eta}",
        )
        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?
        .progress_chars("=> ");
    let pb = ProgressBar::new(plots.len() as u64).with_style(pb_style);

    let render_results: Vec<Result<()>> = plots
        .par_iter()
        .map(|plot| {
            let result = plotting::render_scatter(plot, &score_table, &merged);
            pb.inc(1);
            result
        })
        .collect();
    pb.finish_with_message("Plot rendering complete.");

    let mut render_errors: Vec<Error> = Vec::new();
    for (plot, result) in plots.iter().zip(render_results) {
        match result {
            Ok(()) => info!("Wrote {}", plot.output_path.display()),
            Err(e) => render_errors.push(anyhow!(
                "Error rendering {}: {}",
                plot.output_path.display(),
                e
            )),
        }
    }
    if !render_errors.is_empty() {
        for err in render_errors {
            error!("{}", err);
        }
        return Err(anyhow!(
            "Failed to render one or more plots. See errors above."
        ));
    }

    // --- 5. Print Sample Distribution ---
    summary::print_distribution(&merged);

    info!(
        "popstruct_plot finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

// --- Module Implementations ---

mod cli {
    use super::{anyhow, Result};
    use clap::Parser; // For the derive macro to find Parser
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Population-structure PCA plots from score and metadata tables.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// PC score table (CSV or TSV) with a sample column and PC1..PCk columns.
        #[arg(short = 's', long = "scores", required = true)]
        pub(crate) scores: PathBuf,

        /// Eigenvalue table (CSV or TSV), one eigenvalue per component.
        #[arg(short = 'e', long = "eigenvalues", required = true)]
        pub(crate) eigenvalues: PathBuf,

        /// Sample metadata table (CSV or TSV) with Sample, State and County columns.
        #[arg(short = 'm', long = "metadata", required = true)]
        pub(crate) metadata: PathBuf,

        /// Output prefix; each plot is written to <PREFIX>.PC<a>_PC<b>.png.
        #[arg(short = 'o', long = "out", required = true)]
        pub(crate) output_prefix: String,

        /// Comma-separated PC pairs to plot, e.g. "1:2,1:3".
        #[arg(long, default_value = "1:2")]
        pub(crate) pairs: String,

        #[arg(long, default_value = "PCA Plot - I. scapularis Population Structure")]
        pub(crate) title: String,

        #[arg(long, default_value_t = 1400)]
        pub(crate) width: u32,

        #[arg(long, default_value_t = 1000)]
        pub(crate) height: u32,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }

    /// Parses a "--pairs" specification such as "1:2,1:3" into 1-based PC pairs.
    pub(crate) fn parse_pairs(spec: &str) -> Result<Vec<(usize, usize)>> {
        let mut pairs = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (a, b) = part.split_once(':').ok_or_else(|| {
                anyhow!(
                    "Invalid PC pair '{}': expected the form <x>:<y>, e.g. 1:2.",
                    part
                )
            })?;
            let parse_component = |s: &str| -> Result<usize> {
                let trimmed = s.trim();
                let k: usize = trimmed
                    .parse()
                    .map_err(|_| anyhow!("Invalid PC number '{}' in pair '{}'.", trimmed, part))?;
                if k == 0 {
                    return Err(anyhow!("PC numbers are 1-based; got 0 in pair '{}'.", part));
                }
                Ok(k)
            };
            pairs.push((parse_component(a)?, parse_component(b)?));
        }
        if pairs.is_empty() {
            return Err(anyhow!("No PC pairs specified in --pairs '{}'.", spec));
        }
        Ok(pairs)
    }
}

mod tables {
    use super::warn;
    use csv::ReaderBuilder;
    use ndarray::{Array1, Array2};
    use std::path::Path;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub(crate) enum TableError {
        #[error("failed to open {path}: {source}")]
        Open { path: String, source: csv::Error },
        #[error("failed to read {path}: {source}")]
        Read { path: String, source: csv::Error },
        #[error("{path}: missing required column(s): {missing}")]
        MissingColumns { path: String, missing: String },
        #[error("{path} line {line}: {message}")]
        Malformed {
            path: String,
            line: usize,
            message: String,
        },
        #[error("{path}: {message}")]
        Invalid { path: String, message: String },
    }

    /// Per-sample principal-component scores, columns aligned with `pc_numbers`.
    #[derive(Debug)]
    pub(crate) struct ScoreTable {
        pub(crate) sample_ids: Vec<String>,
        pub(crate) pc_numbers: Vec<usize>, // ascending
        pub(crate) scores: Array2<f64>,    // samples x components
    }

    impl ScoreTable {
        pub(crate) fn column_for_pc(&self, pc: usize) -> Option<usize> {
            self.pc_numbers.iter().position(|&k| k == pc)
        }
    }

    #[derive(Debug)]
    pub(crate) struct MetadataRow {
        pub(crate) sample: String,
        pub(crate) state: String,
        pub(crate) county: Option<String>,
    }

    // Comma for .csv, tab for everything else (.tsv, .txt, ...).
    fn delimiter_for(path: &Path) -> u8 {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
            _ => b'\t',
        }
    }

    fn open_reader(
        path: &Path,
        has_headers: bool,
        flexible: bool,
    ) -> Result<csv::Reader<std::fs::File>, TableError> {
        ReaderBuilder::new()
            .delimiter(delimiter_for(path))
            .has_headers(has_headers)
            .flexible(flexible)
            .from_path(path)
            .map_err(|e| TableError::Open {
                path: path.display().to_string(),
                source: e,
            })
    }

    /// Loads a PC score table.
    ///
    /// The header row must contain a sample-identifier column (one of `Sample`,
    /// `SampleID`, `IID`, `ind`) and one or more `PC<k>` columns. Other columns
    /// are ignored. Accepts both the `SampleID\tPC1\t...` layout written by
    /// upstream PCA tooling and spreadsheet exports keyed on `Sample`.
    pub(crate) fn load_scores(path: &Path) -> Result<ScoreTable, TableError> {
        const SAMPLE_COLUMN_NAMES: &[&str] = &["Sample", "SampleID", "IID", "ind"];

        let mut reader = open_reader(path, true, false)?;
        let headers = reader
            .headers()
            .map_err(|e| TableError::Read {
                path: path.display().to_string(),
                source: e,
            })?
            .clone();

        let sample_col = headers
            .iter()
            .position(|h| SAMPLE_COLUMN_NAMES.contains(&h.trim()))
            .ok_or_else(|| TableError::MissingColumns {
                path: path.display().to_string(),
                missing: "a sample identifier column (one of Sample, SampleID, IID, ind)"
                    .to_string(),
            })?;

        let mut pc_cols: Vec<(usize, usize)> = Vec::new(); // (PC number, column index)
        for (idx, name) in headers.iter().enumerate() {
            let name = name.trim();
            if let Some(rest) = name.strip_prefix("PC") {
                if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                    let k: usize = rest.parse().map_err(|_| TableError::Invalid {
                        path: path.display().to_string(),
                        message: format!("column '{}' has an out-of-range component number", name),
                    })?;
                    pc_cols.push((k, idx));
                }
            }
        }
        if pc_cols.is_empty() {
            return Err(TableError::MissingColumns {
                path: path.display().to_string(),
                missing: "PC<k> score columns".to_string(),
            });
        }
        pc_cols.sort_unstable();
        if pc_cols[0].0 == 0 {
            return Err(TableError::Invalid {
                path: path.display().to_string(),
                message: "PC numbering is 1-based; found column PC0".to_string(),
            });
        }
        for window in pc_cols.windows(2) {
            if window[0].0 == window[1].0 {
                return Err(TableError::Invalid {
                    path: path.display().to_string(),
                    message: format!("duplicate column PC{}", window[0].0),
                });
            }
        }

        let mut sample_ids: Vec<String> = Vec::new();
        let mut values: Vec<f64> = Vec::new();
        for (row_idx, record) in reader.records().enumerate() {
            let record = record.map_err(|e| TableError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            let line = row_idx + 2; // header is line 1
            let sample = match record.get(sample_col) {
                Some(s) if !s.trim().is_empty() => s.trim().to_string(),
                _ => {
                    return Err(TableError::Malformed {
                        path: path.display().to_string(),
                        line,
                        message: "missing sample identifier".to_string(),
                    })
                }
            };
            for &(k, col) in &pc_cols {
                let cell = record.get(col).unwrap_or("").trim();
                let value: f64 = cell.parse().map_err(|_| TableError::Malformed {
                    path: path.display().to_string(),
                    line,
                    message: format!("column PC{} value '{}' is not a number", k, cell),
                })?;
                if !value.is_finite() {
                    return Err(TableError::Malformed {
                        path: path.display().to_string(),
                        line,
                        message: format!("column PC{} value '{}' is not finite", k, cell),
                    });
                }
                values.push(value);
            }
            sample_ids.push(sample);
        }
        if sample_ids.is_empty() {
            return Err(TableError::Invalid {
                path: path.display().to_string(),
                message: "no data rows found".to_string(),
            });
        }

        let scores = Array2::from_shape_vec((sample_ids.len(), pc_cols.len()), values).map_err(
            |e| TableError::Invalid {
                path: path.display().to_string(),
                message: format!("score matrix shape mismatch: {}", e),
            },
        )?;
        Ok(ScoreTable {
            sample_ids,
            pc_numbers: pc_cols.iter().map(|&(k, _)| k).collect(),
            scores,
        })
    }

    /// Loads one eigenvalue per component.
    ///
    /// With a header row containing `Eigenvalue` that column is read (the
    /// upstream `PC\tEigenvalue` layout); otherwise the first column is read,
    /// skipping a non-numeric leading header cell when present.
    pub(crate) fn load_eigenvalues(path: &Path) -> Result<Array1<f64>, TableError> {
        let mut reader = open_reader(path, false, true)?;
        let mut values: Vec<f64> = Vec::new();
        let mut column = 0usize;
        let mut first = true;
        for (row_idx, record) in reader.records().enumerate() {
            let record = record.map_err(|e| TableError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            let line = row_idx + 1;
            if first {
                first = false;
                if let Some(idx) = record
                    .iter()
                    .position(|h| h.trim().eq_ignore_ascii_case("eigenvalue"))
                {
                    column = idx;
                    continue;
                }
                if record.get(0).unwrap_or("").trim().parse::<f64>().is_err() {
                    // Unrecognized header row; data starts on the next line.
                    continue;
                }
            }
            let cell = record.get(column).unwrap_or("").trim();
            let value: f64 = cell.parse().map_err(|_| TableError::Malformed {
                path: path.display().to_string(),
                line,
                message: format!("eigenvalue '{}' is not a number", cell),
            })?;
            if !value.is_finite() || value < 0.0 {
                return Err(TableError::Malformed {
                    path: path.display().to_string(),
                    line,
                    message: format!("eigenvalue {} is not finite and non-negative", value),
                });
            }
            values.push(value);
        }
        if values.is_empty() {
            return Err(TableError::Invalid {
                path: path.display().to_string(),
                message: "no eigenvalues found".to_string(),
            });
        }
        let total: f64 = values.iter().sum();
        if total <= 0.0 {
            return Err(TableError::Invalid {
                path: path.display().to_string(),
                message: "eigenvalues sum to zero; cannot compute percent variance explained"
                    .to_string(),
            });
        }
        Ok(Array1::from_vec(values))
    }

    /// Loads sample metadata rows. `County` may be empty or `NA`; rows with an
    /// empty `State` are ignored with a warning.
    pub(crate) fn load_metadata(path: &Path) -> Result<Vec<MetadataRow>, TableError> {
        let mut reader = open_reader(path, true, true)?;
        let headers = reader
            .headers()
            .map_err(|e| TableError::Read {
                path: path.display().to_string(),
                source: e,
            })?
            .clone();

        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        let sample_col = find("Sample");
        let state_col = find("State");
        let county_col = find("County");
        let mut missing: Vec<&str> = Vec::new();
        if sample_col.is_none() {
            missing.push("Sample");
        }
        if state_col.is_none() {
            missing.push("State");
        }
        if county_col.is_none() {
            missing.push("County");
        }
        let (Some(sample_col), Some(state_col), Some(county_col)) =
            (sample_col, state_col, county_col)
        else {
            return Err(TableError::MissingColumns {
                path: path.display().to_string(),
                missing: missing.join(", "),
            });
        };

        let mut rows: Vec<MetadataRow> = Vec::new();
        for (row_idx, record) in reader.records().enumerate() {
            let record = record.map_err(|e| TableError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            let line = row_idx + 2;
            let sample = match record.get(sample_col) {
                Some(s) if !s.trim().is_empty() => s.trim().to_string(),
                _ => {
                    return Err(TableError::Malformed {
                        path: path.display().to_string(),
                        line,
                        message: "missing sample identifier".to_string(),
                    })
                }
            };
            let state = record.get(state_col).unwrap_or("").trim().to_string();
            if state.is_empty() {
                warn!(
                    "{} line {}: sample '{}' has no State value; row ignored.",
                    path.display(),
                    line,
                    sample
                );
                continue;
            }
            let county = record
                .get(county_col)
                .map(str::trim)
                .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("NA"))
                .map(String::from);
            rows.push(MetadataRow {
                sample,
                state,
                county,
            });
        }
        if rows.is_empty() {
            return Err(TableError::Invalid {
                path: path.display().to_string(),
                message: "no metadata rows found".to_string(),
            });
        }
        Ok(rows)
    }

    /// Eigenvalues normalized to percentages. `load_eigenvalues` guarantees a
    /// positive sum.
    pub(crate) fn percent_variance_explained(eigenvalues: &Array1<f64>) -> Array1<f64> {
        let total: f64 = eigenvalues.sum();
        eigenvalues * (100.0 / total)
    }
}

mod grouping {
    use super::tables::{MetadataRow, ScoreTable};
    use super::{debug, warn};
    use std::collections::{BTreeMap, HashMap};

    /// The derived per-sample label: Nebraska samples are split out by county
    /// (falling back to the state when the county is unknown); every other
    /// sample is labeled with its state.
    pub(crate) fn location_group(row: &MetadataRow) -> String {
        if row.state == "Nebraska" {
            match &row.county {
                Some(county) => county.clone(),
                None => row.state.clone(),
            }
        } else {
            row.state.clone()
        }
    }

    /// Score rows bucketed by location group. `groups` maps group label to row
    /// indices into the score table; iteration order is sorted by label.
    #[derive(Debug)]
    pub(crate) struct MergedSamples {
        pub(crate) groups: BTreeMap<String, Vec<usize>>,
        pub(crate) total: usize,
        pub(crate) unmatched: usize,
    }

    /// Left join of score rows against metadata on the sample identifier.
    /// Every score row counts toward `total`; rows without a metadata match are
    /// kept out of all groups.
    pub(crate) fn merge(scores: &ScoreTable, metadata: &[MetadataRow]) -> MergedSamples {
        let mut group_by_sample: HashMap<&str, String> = HashMap::new();
        for row in metadata {
            if group_by_sample.contains_key(row.sample.as_str()) {
                warn!(
                    "Duplicate metadata entry for sample '{}'; keeping the first occurrence.",
                    row.sample
                );
                continue;
            }
            group_by_sample.insert(row.sample.as_str(), location_group(row));
        }

        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut unmatched = 0usize;
        for (idx, sample) in scores.sample_ids.iter().enumerate() {
            match group_by_sample.get(sample.as_str()) {
                Some(group) => groups.entry(group.clone()).or_default().push(idx),
                None => {
                    debug!("Sample '{}' has no metadata entry.", sample);
                    unmatched += 1;
                }
            }
        }
        MergedSamples {
            groups,
            total: scores.sample_ids.len(),
            unmatched,
        }
    }
}

mod plotting {
    use super::grouping::MergedSamples;
    use super::tables::ScoreTable;
    use super::{anyhow, Result};
    use plotters::chart::SeriesLabelPosition;
    use plotters::prelude::*;
    use plotters::style::{FontStyle, RGBColor};
    use std::path::PathBuf;

    const MIDWEST_EAST_STATES: &[&str] = &[
        "Iowa",
        "Minnesota",
        "Wisconsin",
        "Michigan",
        "Maine",
        "Maryland",
    ];
    const SOUTHERN_STATES: &[&str] = &[
        "Florida",
        "Virginia",
        "North Carolina",
        "South Carolina",
        "Alabama",
        "Tennessee",
        "Texas",
        "Oklahoma",
        "Kansas",
    ];

    const MARGIN: u32 = 10;
    const X_LABEL_AREA: u32 = 60;
    const Y_LABEL_AREA: u32 = 80;
    // Approximate height consumed by the caption; only feeds the equal-scale
    // axis-range computation.
    const CAPTION_AREA: u32 = 42;
    const POINT_RADIUS: i32 = 5;
    const FILL_ALPHA: f64 = 0.85;

    /// One scatter plot: a PC pair, its variance percentages, and the output
    /// image parameters.
    #[derive(Debug)]
    pub(crate) struct ScatterPlot {
        pub(crate) pc_x: usize,
        pub(crate) pc_y: usize,
        pub(crate) pve_x: f64,
        pub(crate) pve_y: f64,
        pub(crate) title: String,
        pub(crate) width: u32,
        pub(crate) height: u32,
        pub(crate) output_path: PathBuf,
    }

    fn nebraska_county_fill(group: &str) -> Option<RGBColor> {
        match group {
            "Thurston" => Some(RGBColor(0x00, 0xBF, 0xFF)),
            "Dodge" => Some(RGBColor(0xFF, 0x45, 0x00)),
            "Sarpy" => Some(RGBColor(0xDA, 0x70, 0xD6)),
            "Douglas" => Some(RGBColor(0x32, 0xCD, 0x32)),
            _ => None,
        }
    }

    pub(crate) fn group_fill(group: &str) -> RGBColor {
        if MIDWEST_EAST_STATES.contains(&group) {
            return BLACK;
        }
        if SOUTHERN_STATES.contains(&group) {
            return WHITE;
        }
        if let Some(color) = nebraska_county_fill(group) {
            return color;
        }
        RGBColor(128, 128, 128)
    }

    pub(crate) fn legend_label(group: &str) -> String {
        match group {
            "Thurston" | "Dodge" | "Sarpy" | "Douglas" => {
                format!("Nebraska ({} county)", group)
            }
            "South Carolina" => "S. Carolina".to_string(),
            "North Carolina" => "N. Carolina".to_string(),
            other => other.to_string(),
        }
    }

    /// Pads both axis ranges by 5%, then widens the smaller one until both
    /// axes share the same data-units-per-pixel scale.
    pub(crate) fn equalized_ranges(
        x_bounds: (f64, f64),
        y_bounds: (f64, f64),
        plot_px: (u32, u32),
    ) -> ((f64, f64), (f64, f64)) {
        fn padded(lo: f64, hi: f64) -> (f64, f64) {
            let span = hi - lo;
            if span > 0.0 {
                (lo - span * 0.05, hi + span * 0.05)
            } else {
                (lo - 0.5, hi + 0.5)
            }
        }
        let (x_lo, x_hi) = padded(x_bounds.0, x_bounds.1);
        let (y_lo, y_hi) = padded(y_bounds.0, y_bounds.1);
        let units_per_px_x = (x_hi - x_lo) / plot_px.0 as f64;
        let units_per_px_y = (y_hi - y_lo) / plot_px.1 as f64;
        let units_per_px = units_per_px_x.max(units_per_px_y);
        let x_mid = (x_lo + x_hi) / 2.0;
        let y_mid = (y_lo + y_hi) / 2.0;
        let x_half = units_per_px * plot_px.0 as f64 / 2.0;
        let y_half = units_per_px * plot_px.1 as f64 / 2.0;
        (
            (x_mid - x_half, x_mid + x_half),
            (y_mid - y_half, y_mid + y_half),
        )
    }

    pub(crate) fn render_scatter(
        plot: &ScatterPlot,
        scores: &ScoreTable,
        merged: &MergedSamples,
    ) -> Result<()> {
        let col_x = scores
            .column_for_pc(plot.pc_x)
            .ok_or_else(|| anyhow!("PC{} not present in score table", plot.pc_x))?;
        let col_y = scores
            .column_for_pc(plot.pc_y)
            .ok_or_else(|| anyhow!("PC{} not present in score table", plot.pc_y))?;

        let mut x_bounds = (f64::INFINITY, f64::NEG_INFINITY);
        let mut y_bounds = (f64::INFINITY, f64::NEG_INFINITY);
        for members in merged.groups.values() {
            for &idx in members {
                let x = scores.scores[[idx, col_x]];
                let y = scores.scores[[idx, col_y]];
                x_bounds = (x_bounds.0.min(x), x_bounds.1.max(x));
                y_bounds = (y_bounds.0.min(y), y_bounds.1.max(y));
            }
        }
        if !x_bounds.0.is_finite() || !y_bounds.0.is_finite() {
            return Err(anyhow!("No grouped samples available to plot."));
        }

        let plot_w = plot.width.saturating_sub(2 * MARGIN + Y_LABEL_AREA);
        let plot_h = plot
            .height
            .saturating_sub(2 * MARGIN + X_LABEL_AREA + CAPTION_AREA);
        if plot_w < 100 || plot_h < 100 {
            return Err(anyhow!(
                "Image dimensions {}x{} leave no room for the plot area.",
                plot.width,
                plot.height
            ));
        }
        let ((x_min, x_max), (y_min, y_max)) =
            equalized_ranges(x_bounds, y_bounds, (plot_w, plot_h));

        let root =
            BitMapBackend::new(&plot.output_path, (plot.width, plot.height)).into_drawing_area();
        root.fill(&WHITE)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(
                &plot.title,
                ("sans-serif", 32).into_font().style(FontStyle::Bold),
            )
            .margin(MARGIN)
            .x_label_area_size(X_LABEL_AREA)
            .y_label_area_size(Y_LABEL_AREA)
            .build_cartesian_2d(x_min..x_max, y_min..y_max)?;

        chart
            .configure_mesh()
            .x_desc(format!("PC{} ({:.1}%)", plot.pc_x, plot.pve_x))
            .y_desc(format!("PC{} ({:.1}%)", plot.pc_y, plot.pve_y))
            .axis_desc_style(("sans-serif", 28).into_font().style(FontStyle::Bold))
            .label_style(("sans-serif", 18))
            .light_line_style(&TRANSPARENT)
            .bold_line_style(BLACK.mix(0.1))
            .draw()?;

        for (group, members) in &merged.groups {
            let fill = group_fill(group);
            let label = format!("{} (n={})", legend_label(group), members.len());
            let points: Vec<(f64, f64)> = members
                .iter()
                .map(|&idx| (scores.scores[[idx, col_x]], scores.scores[[idx, col_y]]))
                .collect();
            chart
                .draw_series(points.iter().map(|&(x, y)| {
                    EmptyElement::at((x, y))
                        + Circle::new((0, 0), POINT_RADIUS, fill.mix(FILL_ALPHA).filled())
                        + Circle::new((0, 0), POINT_RADIUS, BLACK.stroke_width(1))
                }))?
                .label(label)
                .legend(move |(x, y)| {
                    EmptyElement::at((x, y))
                        + Circle::new((0, 0), POINT_RADIUS, fill.mix(FILL_ALPHA).filled())
                        + Circle::new((0, 0), POINT_RADIUS, BLACK.stroke_width(1))
                });
        }

        // Smaller legend entries once the group list gets crowded.
        let label_font_size = if merged.groups.len() > 8 { 20 } else { 24 };
        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperRight)
            .background_style(WHITE.mix(0.85))
            .border_style(&BLACK)
            .label_font(("sans-serif", label_font_size))
            .draw()?;
        root.present()?;
        Ok(())
    }
}

mod summary {
    use super::grouping::MergedSamples;

    pub(crate) fn format_distribution(merged: &MergedSamples) -> String {
        let mut out = String::new();
        out.push_str("\nSample distribution by state:\n");
        out.push_str(&"-".repeat(30));
        out.push('\n');
        for (group, members) in &merged.groups {
            out.push_str(&format!("{}: {} samples\n", group, members.len()));
        }
        out.push_str(&format!("\nTotal samples: {}\n", merged.total));
        out
    }

    pub(crate) fn print_distribution(merged: &MergedSamples) {
        print!("{}", format_distribution(merged));
    }
}

#[cfg(test)]
mod tests {
    use super::cli;
    use super::grouping::{self, MergedSamples};
    use super::plotting;
    use super::summary;
    use super::tables::{self, MetadataRow, ScoreTable, TableError};
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn write_fixture(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join(name);
        fs::write(&path, contents).expect("write fixture");
        (dir, path)
    }

    #[test]
    fn loads_scores_from_upstream_tsv_layout() {
        let (_dir, path) = write_fixture(
            "run1.pca.tsv",
            "SampleID\tPC1\tPC2\tPC3\nS1\t0.1\t-0.2\t0.3\nS2\t0.4\t0.5\t-0.6\n",
        );
        let table = tables::load_scores(&path).unwrap();
        assert_eq!(table.sample_ids, vec!["S1", "S2"]);
        assert_eq!(table.pc_numbers, vec![1, 2, 3]);
        assert_eq!(table.scores.shape(), &[2, 3]);
        assert_relative_eq!(table.scores[[1, 2]], -0.6);
    }

    #[test]
    fn loads_scores_from_csv_with_extra_and_reordered_columns() {
        let (_dir, path) = write_fixture(
            "scores.csv",
            "Sample,Region,PC2,PC1\nS1,west,2.0,1.0\nS2,east,4.0,3.0\n",
        );
        let table = tables::load_scores(&path).unwrap();
        assert_eq!(table.pc_numbers, vec![1, 2]);
        // Columns are stored in ascending PC order regardless of file order.
        assert_relative_eq!(table.scores[[0, 0]], 1.0);
        assert_relative_eq!(table.scores[[0, 1]], 2.0);
        assert_relative_eq!(table.scores[[1, 0]], 3.0);
    }

    #[test]
    fn score_table_rejects_duplicate_pc_columns() {
        let (_dir, path) = write_fixture("dup.csv", "Sample,PC1,PC1\nS1,1.0,2.0\n");
        let err = tables::load_scores(&path).unwrap_err();
        assert!(matches!(err, TableError::Invalid { .. }));
        assert!(err.to_string().contains("duplicate column PC1"));
    }

    #[test]
    fn score_table_requires_sample_column() {
        let (_dir, path) = write_fixture("nosample.csv", "Id,PC1\nS1,1.0\n");
        let err = tables::load_scores(&path).unwrap_err();
        assert!(matches!(err, TableError::MissingColumns { .. }));
    }

    #[test]
    fn score_table_reports_bad_values_with_line_numbers() {
        let (_dir, path) = write_fixture("bad.csv", "Sample,PC1\nS1,1.0\nS2,not-a-number\n");
        let err = tables::load_scores(&path).unwrap_err();
        match err {
            TableError::Malformed { line, .. } => assert_eq!(line, 3),
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn score_table_rejects_non_finite_values() {
        let (_dir, path) = write_fixture("nan.csv", "Sample,PC1\nS1,NaN\n");
        let err = tables::load_scores(&path).unwrap_err();
        assert!(matches!(err, TableError::Malformed { line: 2, .. }));
        assert!(err.to_string().contains("not finite"));
    }

    #[test]
    fn loads_eigenvalues_from_upstream_layout() {
        let (_dir, path) = write_fixture("eig.tsv", "PC\tEigenvalue\n1\t4.0\n2\t1.0\n");
        let values = tables::load_eigenvalues(&path).unwrap();
        assert_eq!(values.len(), 2);
        assert_relative_eq!(values[0], 4.0);
    }

    #[test]
    fn loads_eigenvalues_from_headerless_column() {
        let (_dir, path) = write_fixture("eig.txt", "4.0\n1.0\n");
        let values = tables::load_eigenvalues(&path).unwrap();
        assert_eq!(values.len(), 2);
        assert_relative_eq!(values[1], 1.0);
    }

    #[test]
    fn loads_eigenvalues_past_unknown_header() {
        let (_dir, path) = write_fixture("eig.csv", "V1\n4.0\n1.0\n");
        let values = tables::load_eigenvalues(&path).unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn rejects_negative_eigenvalues() {
        let (_dir, path) = write_fixture("eig.tsv", "Eigenvalue\n4.0\n-1.0\n");
        let err = tables::load_eigenvalues(&path).unwrap_err();
        assert!(matches!(err, TableError::Malformed { line: 3, .. }));
    }

    #[test]
    fn rejects_zero_sum_eigenvalues() {
        let (_dir, path) = write_fixture("eig.txt", "0\n0\n");
        let err = tables::load_eigenvalues(&path).unwrap_err();
        assert!(matches!(err, TableError::Invalid { .. }));
    }

    #[test]
    fn percent_variance_explained_sums_to_100() {
        let values = array![4.0, 1.0];
        let pve = tables::percent_variance_explained(&values);
        assert_relative_eq!(pve[0], 80.0);
        assert_relative_eq!(pve[1], 20.0);
        assert_relative_eq!(pve.sum(), 100.0);
    }

    #[test]
    fn loads_metadata_with_missing_counties() {
        let (_dir, path) = write_fixture(
            "meta.csv",
            "Sample,State,County\nT1,Nebraska,Thurston\nT2,Iowa,\nT3,Nebraska,NA\nT4,Maine\n",
        );
        let rows = tables::load_metadata(&path).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].county.as_deref(), Some("Thurston"));
        assert_eq!(rows[1].county, None);
        assert_eq!(rows[2].county, None);
        assert_eq!(rows[3].county, None);
    }

    #[test]
    fn metadata_rows_without_state_are_skipped() {
        let (_dir, path) = write_fixture("meta.csv", "Sample,State,County\nT1,,\nT2,Iowa,\n");
        let rows = tables::load_metadata(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sample, "T2");
    }

    #[test]
    fn metadata_requires_all_columns() {
        let (_dir, path) = write_fixture("meta.csv", "Sample,State\nT1,Iowa\n");
        let err = tables::load_metadata(&path).unwrap_err();
        assert!(err.to_string().contains("County"));
    }

    fn meta(sample: &str, state: &str, county: Option<&str>) -> MetadataRow {
        MetadataRow {
            sample: sample.to_string(),
            state: state.to_string(),
            county: county.map(String::from),
        }
    }

    #[test]
    fn nebraska_samples_group_by_county() {
        assert_eq!(
            grouping::location_group(&meta("S", "Nebraska", Some("Thurston"))),
            "Thurston"
        );
        assert_eq!(
            grouping::location_group(&meta("S", "Nebraska", None)),
            "Nebraska"
        );
        // County is only honored for Nebraska.
        assert_eq!(
            grouping::location_group(&meta("S", "Iowa", Some("Polk"))),
            "Iowa"
        );
    }

    fn score_table(sample_ids: &[&str], pcs: usize) -> ScoreTable {
        let scores = Array2::from_shape_fn((sample_ids.len(), pcs), |(r, c)| {
            (r as f64) + (c as f64) / 10.0
        });
        ScoreTable {
            sample_ids: sample_ids.iter().map(|s| s.to_string()).collect(),
            pc_numbers: (1..=pcs).collect(),
            scores,
        }
    }

    #[test]
    fn merge_is_a_left_join_on_sample_id() {
        let scores = score_table(&["S1", "S2", "S3"], 2);
        let metadata = vec![
            meta("S1", "Iowa", None),
            meta("S2", "Nebraska", Some("Dodge")),
            meta("S2", "Florida", None), // duplicate; first occurrence wins
        ];
        let merged = grouping::merge(&scores, &metadata);
        assert_eq!(merged.total, 3);
        assert_eq!(merged.unmatched, 1);
        assert_eq!(merged.groups.len(), 2);
        assert_eq!(merged.groups["Iowa"], vec![0]);
        assert_eq!(merged.groups["Dodge"], vec![1]);
    }

    #[test]
    fn parse_pairs_accepts_lists_with_whitespace() {
        assert_eq!(cli::parse_pairs("1:2").unwrap(), vec![(1, 2)]);
        assert_eq!(
            cli::parse_pairs("1:2, 1:3,2:3").unwrap(),
            vec![(1, 2), (1, 3), (2, 3)]
        );
    }

    #[test]
    fn parse_pairs_rejects_malformed_specs() {
        assert!(cli::parse_pairs("3").is_err());
        assert!(cli::parse_pairs("a:b").is_err());
        assert!(cli::parse_pairs("0:1").is_err());
        assert!(cli::parse_pairs("").is_err());
    }

    #[test]
    fn group_fill_follows_the_study_style_tables() {
        let thurston = plotting::group_fill("Thurston");
        assert_eq!((thurston.0, thurston.1, thurston.2), (0x00, 0xBF, 0xFF));
        let iowa = plotting::group_fill("Iowa");
        assert_eq!((iowa.0, iowa.1, iowa.2), (0, 0, 0));
        let florida = plotting::group_fill("Florida");
        assert_eq!((florida.0, florida.1, florida.2), (255, 255, 255));
        let unknown = plotting::group_fill("Ontario");
        assert_eq!((unknown.0, unknown.1, unknown.2), (128, 128, 128));
    }

    #[test]
    fn legend_labels_apply_study_overrides() {
        assert_eq!(
            plotting::legend_label("Thurston"),
            "Nebraska (Thurston county)"
        );
        assert_eq!(plotting::legend_label("South Carolina"), "S. Carolina");
        assert_eq!(plotting::legend_label("North Carolina"), "N. Carolina");
        assert_eq!(plotting::legend_label("Iowa"), "Iowa");
    }

    #[test]
    fn equalized_ranges_match_pixel_scales() {
        let ((x_lo, x_hi), (y_lo, y_hi)) =
            plotting::equalized_ranges((0.0, 10.0), (0.0, 10.0), (100, 200));
        let units_x = (x_hi - x_lo) / 100.0;
        let units_y = (y_hi - y_lo) / 200.0;
        assert_relative_eq!(units_x, units_y, max_relative = 1e-12);
        // Neither range shrinks below its padded data span.
        assert!(x_lo <= -0.5 && x_hi >= 10.5);
        assert!(y_lo <= -0.5 && y_hi >= 10.5);
    }

    #[test]
    fn equalized_ranges_handle_degenerate_spans() {
        let ((x_lo, x_hi), (y_lo, y_hi)) =
            plotting::equalized_ranges((3.0, 3.0), (1.0, 2.0), (100, 100));
        assert!(x_hi > x_lo);
        assert!(y_hi > y_lo);
        assert_relative_eq!(x_hi - x_lo, y_hi - y_lo, max_relative = 1e-12);
    }

    #[test]
    fn distribution_summary_matches_expected_text() {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        groups.insert("Iowa".to_string(), vec![0, 2]);
        groups.insert("Thurston".to_string(), vec![1]);
        let merged = MergedSamples {
            groups,
            total: 4,
            unmatched: 1,
        };
        let text = summary::format_distribution(&merged);
        let expected = "\nSample distribution by state:\n\
                        ------------------------------\n\
                        Iowa: 2 samples\n\
                        Thurston: 1 samples\n\
                        \nTotal samples: 4\n";
        assert_eq!(text, expected);
    }
}

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;
use crate::error::{BuildError, ConfigError};
use crate::scheduler::job::{CompositeKey, JobDescription, SampleCandidate};

const SAMPLESHEET_NAME: &str = "samplesheet.csv";
const DEFAULT_STRANDEDNESS: &str = "auto";

/// Turns a claimed candidate into runnable job descriptions.
///
/// Implementations must give every composite key its own output location.
/// A build may be repeated for a key whose earlier job already succeeded.
pub trait JobBuilder: Send + Sync {
    /// Check the settings every build depends on. Runs once per pass,
    /// before anything is claimed.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// One job description per pipeline run for `candidate`.
    fn build(&self, candidate: &SampleCandidate) -> Result<Vec<JobDescription>, BuildError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PipelineMode {
    Rnaseq,
    Rnafusion,
}

impl PipelineMode {
    fn parse(value: &str) -> Result<Self, BuildError> {
        match value {
            "rnaseq" => Ok(PipelineMode::Rnaseq),
            "rnafusion" => Ok(PipelineMode::Rnafusion),
            other => Err(BuildError::UnsupportedOption {
                key: "pipeline.pipelines",
                value: other.to_string(),
            }),
        }
    }

    fn name(self) -> &'static str {
        match self {
            PipelineMode::Rnaseq => "rnaseq",
            PipelineMode::Rnafusion => "rnafusion",
        }
    }
}

/// Builds `nextflow run` invocations of the nf-core rnaseq/rnafusion pipelines.
///
/// Every configured pipeline runs against the same samplesheet under
/// `<output_dir>/<sample>/<run_tag>/`, each with its own launch directory,
/// work directory and logs.
#[derive(Debug, Clone)]
pub struct NextflowBuilder {
    config: PipelineConfig,
}

impl NextflowBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    fn require<'a>(value: &'a Option<String>, key: &'static str) -> Result<&'a str, BuildError> {
        value
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or(BuildError::MissingKey(key))
    }

    fn fusion_key(&self, name: &str, key: &'static str) -> Result<&str, BuildError> {
        self.config
            .fusion
            .get(name)
            .map(String::as_str)
            .ok_or(BuildError::MissingKey(key))
    }

    fn output_root(&self) -> Result<&Path, BuildError> {
        self.config
            .output_dir
            .as_deref()
            .ok_or(BuildError::MissingKey("pipeline.output_dir"))
    }

    fn modes(&self) -> Result<Vec<PipelineMode>, BuildError> {
        if self.config.pipelines.is_empty() {
            return Err(BuildError::MissingKey("pipeline.pipelines"));
        }
        let mut seen = HashSet::new();
        let mut modes = Vec::with_capacity(self.config.pipelines.len());
        for name in &self.config.pipelines {
            let mode = PipelineMode::parse(name)?;
            if !seen.insert(mode) {
                return Err(BuildError::UnsupportedOption {
                    key: "pipeline.pipelines",
                    value: format!("{name} (listed twice)"),
                });
            }
            modes.push(mode);
        }
        Ok(modes)
    }

    /// Arguments of every configured pipeline for the output location `out`.
    /// Touches nothing on disk.
    fn invocations(&self, out: &Path) -> Result<Vec<(PipelineMode, Vec<String>)>, BuildError> {
        let samplesheet = out.join(SAMPLESHEET_NAME);
        self.modes()?
            .into_iter()
            .map(|mode| -> Result<_, BuildError> {
                let mut args = match mode {
                    PipelineMode::Rnaseq => self.rnaseq_args(out, &samplesheet)?,
                    PipelineMode::Rnafusion => self.rnafusion_args(out, &samplesheet)?,
                };
                for (name, value) in &self.config.overrides {
                    args.push(format!("--{name}"));
                    args.push(value.clone());
                }
                Ok((mode, args))
            })
            .collect()
    }

    fn common_args(&self, mode: PipelineMode, out: &Path) -> Result<Vec<String>, BuildError> {
        let name = mode.name();
        let main = Self::require(&self.config.main, "pipeline.main")?;
        let profile = Self::require(&self.config.profile, "pipeline.profile")?;

        let mut args = vec![
            "-log".to_string(),
            path_arg(&out.join("logs").join(format!("{name}.log"))),
            "run".to_string(),
            main.to_string(),
            "-work-dir".to_string(),
            path_arg(&work_location(out, mode)),
            "-with-report".to_string(),
            path_arg(&out.join("logs").join(format!("{name}-execution.html"))),
        ];
        if let Some(custom) = &self.config.custom_config {
            args.push("-c".to_string());
            args.push(path_arg(custom));
        }
        args.push("-profile".to_string());
        args.push(profile.to_string());
        Ok(args)
    }

    fn rnaseq_args(&self, out: &Path, samplesheet: &Path) -> Result<Vec<String>, BuildError> {
        let mut args = self.common_args(PipelineMode::Rnaseq, out)?;
        args.push("--outdir".to_string());
        args.push(path_arg(&out.join(PipelineMode::Rnaseq.name())));

        let aligner = Self::require(&self.config.aligner, "pipeline.aligner")?;
        let (index_name, index_key) = match aligner {
            "star_salmon" => ("star_index", "pipeline.references.star_index"),
            "star_rsem" => ("rsem_index", "pipeline.references.rsem_index"),
            other => {
                return Err(BuildError::UnsupportedOption {
                    key: "pipeline.aligner",
                    value: other.to_string(),
                })
            }
        };

        let references = &self.config.references;
        let index = references
            .get(index_name)
            .filter(|v| !v.trim().is_empty())
            .ok_or(BuildError::MissingKey(index_key))?;
        let explicit: Vec<_> = references
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "star_index" | "rsem_index"))
            .collect();
        if explicit.is_empty() {
            args.push("--genome".to_string());
            args.push(Self::require(&self.config.genome, "pipeline.genome")?.to_string());
        } else {
            for (key, value) in explicit {
                args.push(format!("--{key}"));
                args.push(value.clone());
            }
        }

        args.push("--aligner".to_string());
        args.push(aligner.to_string());
        if aligner != "star_salmon" {
            args.push("--pseudo_aligner".to_string());
            args.push("salmon".to_string());
        }
        args.push(format!("--{index_name}"));
        args.push(index.clone());

        args.push("--input".to_string());
        args.push(path_arg(samplesheet));
        Ok(args)
    }

    fn rnafusion_args(&self, out: &Path, samplesheet: &Path) -> Result<Vec<String>, BuildError> {
        let mut args = self.common_args(PipelineMode::Rnafusion, out)?;
        args.extend([
            "--all".to_string(),
            "--genomes_base".to_string(),
            self.fusion_key("genomes_base", "pipeline.fusion.genomes_base")?
                .to_string(),
            "--fusioninspector_filter".to_string(),
            "--fusionreport-tool-cutoff".to_string(),
            self.fusion_key(
                "fusionreport_tool_cutoff",
                "pipeline.fusion.fusionreport_tool_cutoff",
            )?
            .to_string(),
            "--read_length".to_string(),
            self.fusion_key("read_length", "pipeline.fusion.read_length")?
                .to_string(),
        ]);
        for (key, value) in &self.config.fusion {
            if matches!(
                key.as_str(),
                "genomes_base" | "fusionreport_tool_cutoff" | "read_length"
            ) {
                continue;
            }
            args.push(format!("--{key}"));
            args.push(value.clone());
        }
        args.push("--input".to_string());
        args.push(path_arg(samplesheet));
        args.push("--outdir".to_string());
        args.push(path_arg(&out.join(PipelineMode::Rnafusion.name())));
        Ok(args)
    }
}

impl JobBuilder for NextflowBuilder {
    fn validate(&self) -> Result<(), ConfigError> {
        let check = || -> Result<(), BuildError> {
            Self::require(&self.config.nextflow, "pipeline.nextflow")?;
            self.invocations(self.output_root()?)?;
            Ok(())
        };
        check().map_err(ConfigError::Pipeline)
    }

    fn build(&self, candidate: &SampleCandidate) -> Result<Vec<JobDescription>, BuildError> {
        let program = Self::require(&self.config.nextflow, "pipeline.nextflow")?;
        let key = &candidate.key;
        let out = output_location(self.output_root()?, key);

        // Validate every key before touching the filesystem.
        let invocations = self.invocations(&out)?;
        let strandedness = self
            .config
            .strandedness
            .as_deref()
            .unwrap_or(DEFAULT_STRANDEDNESS);
        let contents = samplesheet_contents(candidate, strandedness)?;

        let not_writable = |source: std::io::Error| BuildError::OutputNotWritable {
            path: out.clone(),
            source,
        };
        fs::create_dir_all(out.join("logs"))
            .and_then(|_| fs::write(out.join(SAMPLESHEET_NAME), contents))
            .map_err(not_writable)?;

        invocations
            .into_iter()
            .map(|(mode, args)| -> Result<JobDescription, BuildError> {
                let launch_dir = out.join(mode.name());
                fs::create_dir_all(&launch_dir).map_err(not_writable)?;
                tracing::debug!(key = %key, pipeline = mode.name(), output = %launch_dir.display(), "Built job description");
                Ok(
                    JobDescription::new(key.clone(), format!("nf-core/{}", mode.name()), program)
                        .with_args(args)
                        .with_work_dir(work_location(&out, mode))
                        .with_output_dir(launch_dir),
                )
            })
            .collect()
    }
}

/// `sample,fastq_1,fastq_2,strandedness` with one row per input group.
pub fn samplesheet_contents(
    candidate: &SampleCandidate,
    strandedness: &str,
) -> Result<String, BuildError> {
    let mut sheet = String::from("sample,fastq_1,fastq_2,strandedness\n");
    for group in &candidate.input_groups {
        let (r1, r2) = match group.paths.as_slice() {
            [r1] => (path_arg(r1), String::new()),
            [r1, r2] => (path_arg(r1), path_arg(r2)),
            other => {
                return Err(BuildError::UnsupportedLayout {
                    run_tag: group.run_tag.clone(),
                    files: other.len(),
                })
            }
        };
        sheet.push_str(&format!(
            "{},{},{},{}\n",
            candidate.key.sample_id, r1, r2, strandedness
        ));
    }
    Ok(sheet)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn work_location(out: &Path, mode: PipelineMode) -> PathBuf {
    out.join("work").join(mode.name())
}

/// Per-key output directory under `output_root`. Unique for every composite key.
pub fn output_location(output_root: &Path, key: &CompositeKey) -> PathBuf {
    output_root.join(&key.sample_id).join(&key.run_tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::InputGroup;
    use uuid::Uuid;

    fn candidate() -> SampleCandidate {
        SampleCandidate {
            key: CompositeKey::new("S1", "240101_FC"),
            queue_tag: "q".to_string(),
            record_id: Uuid::new_v4(),
            input_groups: vec![
                InputGroup {
                    run_tag: "231201_FC0".to_string(),
                    paths: vec![PathBuf::from("/in/a_R1.fastq.gz"), PathBuf::from("/in/a_R2.fastq.gz")],
                    total_reads: Some(100),
                },
                InputGroup {
                    run_tag: "240101_FC".to_string(),
                    paths: vec![PathBuf::from("/in/b_R1.fastq.gz")],
                    total_reads: None,
                },
            ],
        }
    }

    fn rnaseq_config(output_dir: &Path) -> PipelineConfig {
        PipelineConfig {
            pipelines: vec!["rnaseq".to_string()],
            nextflow: Some("nextflow".to_string()),
            main: Some("/opt/rnaseq/main.nf".to_string()),
            profile: Some("singularity".to_string()),
            output_dir: Some(output_dir.to_path_buf()),
            genome: Some("GRCh38".to_string()),
            aligner: Some("star_salmon".to_string()),
            references: [("star_index".to_string(), "/refs/star".to_string())].into(),
            ..PipelineConfig::default()
        }
    }

    fn with_fusion_keys(mut config: PipelineConfig) -> PipelineConfig {
        config.fusion.insert("genomes_base".into(), "/refs/fusion".into());
        config.fusion.insert("fusionreport_tool_cutoff".into(), "2".into());
        config.fusion.insert("read_length".into(), "150".into());
        config
    }

    fn build_one(config: PipelineConfig) -> JobDescription {
        let mut jobs = NextflowBuilder::new(config).build(&candidate()).unwrap();
        assert_eq!(jobs.len(), 1);
        jobs.remove(0)
    }

    fn position(args: &[String], flag: &str) -> usize {
        args.iter()
            .position(|a| a == flag)
            .unwrap_or_else(|| panic!("{flag} missing from {args:?}"))
    }

    #[test]
    fn rnaseq_job_layout() {
        let dir = tempfile::tempdir().unwrap();
        let job = build_one(rnaseq_config(dir.path()));

        let out = dir.path().join("S1").join("240101_FC");
        assert_eq!(job.label, "nf-core/rnaseq");
        assert_eq!(job.program, "nextflow");
        assert_eq!(job.output_dir, out.join("rnaseq"));
        assert!(job.output_dir.is_dir());
        assert_eq!(job.work_dir, Some(out.join("work").join("rnaseq")));
        assert_eq!(job.args[0], "-log");
        assert_eq!(job.args[2], "run");
        assert_eq!(job.args[3], "/opt/rnaseq/main.nf");

        let genome = position(&job.args, "--genome");
        assert_eq!(job.args[genome + 1], "GRCh38");
        let input = position(&job.args, "--input");
        assert_eq!(PathBuf::from(&job.args[input + 1]), out.join("samplesheet.csv"));
        assert!(!job.args.contains(&"--pseudo_aligner".to_string()));
        let index = position(&job.args, "--star_index");
        assert_eq!(job.args[index + 1], "/refs/star");
    }

    #[test]
    fn samplesheet_is_written() {
        let dir = tempfile::tempdir().unwrap();
        build_one(rnaseq_config(dir.path()));

        let out = output_location(dir.path(), &candidate().key);
        let sheet = fs::read_to_string(out.join("samplesheet.csv")).unwrap();
        assert_eq!(
            sheet,
            "sample,fastq_1,fastq_2,strandedness\n\
             S1,/in/a_R1.fastq.gz,/in/a_R2.fastq.gz,auto\n\
             S1,/in/b_R1.fastq.gz,,auto\n"
        );
    }

    #[test]
    fn every_configured_pipeline_gets_its_own_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = with_fusion_keys(rnaseq_config(dir.path()));
        config.pipelines = PipelineConfig::default().pipelines;

        let jobs = NextflowBuilder::new(config).build(&candidate()).unwrap();

        let out = output_location(dir.path(), &candidate().key);
        let labels: Vec<_> = jobs.iter().map(|j| j.label.as_str()).collect();
        assert_eq!(labels, ["nf-core/rnaseq", "nf-core/rnafusion"]);
        assert_ne!(jobs[0].work_dir, jobs[1].work_dir);
        assert_ne!(jobs[0].output_dir, jobs[1].output_dir);
        for job in &jobs {
            assert!(job.output_dir.starts_with(&out));
            let input = position(&job.args, "--input");
            assert_eq!(PathBuf::from(&job.args[input + 1]), out.join("samplesheet.csv"));
        }
        let log = position(&jobs[1].args, "-log");
        assert_eq!(
            PathBuf::from(&jobs[1].args[log + 1]),
            out.join("logs").join("rnafusion.log")
        );
    }

    #[test]
    fn references_replace_genome() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = rnaseq_config(dir.path());
        config.aligner = Some("star_rsem".to_string());
        config.references.insert("fasta".into(), "/refs/genome.fa".into());
        config.references.insert("rsem_index".into(), "/refs/rsem".into());
        config.references.insert("star_index".into(), "/refs/star".into());

        let job = build_one(config);

        assert!(!job.args.contains(&"--genome".to_string()));
        assert!(!job.args.contains(&"--star_index".to_string()));
        let fasta = position(&job.args, "--fasta");
        assert_eq!(job.args[fasta + 1], "/refs/genome.fa");
        let rsem = position(&job.args, "--rsem_index");
        assert_eq!(job.args[rsem + 1], "/refs/rsem");
        let pseudo = position(&job.args, "--pseudo_aligner");
        assert_eq!(job.args[pseudo + 1], "salmon");
    }

    #[test]
    fn missing_aligner_index_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = rnaseq_config(dir.path());
        config.references.clear();
        config.references.insert("fasta".into(), "/refs/genome.fa".into());
        config.references.insert("rsem_index".into(), "/refs/rsem".into());

        let err = NextflowBuilder::new(config).build(&candidate()).unwrap_err();

        assert!(matches!(
            err,
            BuildError::MissingKey("pipeline.references.star_index")
        ));
        assert!(!dir.path().join("S1").exists());

        // the iGenomes genome does not stand in for the index either
        let mut config = rnaseq_config(dir.path());
        config.references.clear();
        let err = NextflowBuilder::new(config).build(&candidate()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::MissingKey("pipeline.references.star_index")
        ));
    }

    #[test]
    fn overrides_come_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = rnaseq_config(dir.path());
        config.overrides.insert("skip_qc".into(), "true".into());

        let job = build_one(config);
        let n = job.args.len();
        assert_eq!(job.args[n - 2..], ["--skip_qc".to_string(), "true".to_string()]);
    }

    #[test]
    fn unsupported_aligner_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = rnaseq_config(dir.path());
        config.aligner = Some("hisat2".to_string());

        let err = NextflowBuilder::new(config).build(&candidate()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::UnsupportedOption {
                key: "pipeline.aligner",
                ..
            }
        ));
        // Nothing is written for a rejected build.
        assert!(!dir.path().join("S1").exists());
    }

    #[test]
    fn unknown_or_repeated_pipeline_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for pipelines in [vec!["wgs"], vec!["rnaseq", "rnaseq"]] {
            let mut config = rnaseq_config(dir.path());
            config.pipelines = pipelines.into_iter().map(String::from).collect();

            let err = NextflowBuilder::new(config).build(&candidate()).unwrap_err();
            assert!(matches!(
                err,
                BuildError::UnsupportedOption {
                    key: "pipeline.pipelines",
                    ..
                }
            ));
        }
    }

    #[test]
    fn missing_key_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = rnaseq_config(dir.path());
        config.main = None;

        let err = NextflowBuilder::new(config).build(&candidate()).unwrap_err();
        assert!(matches!(err, BuildError::MissingKey("pipeline.main")));
    }

    #[test]
    fn rnafusion_requires_fusion_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = rnaseq_config(dir.path());
        config.pipelines = vec!["rnafusion".to_string()];

        let err = NextflowBuilder::new(config.clone())
            .build(&candidate())
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::MissingKey("pipeline.fusion.genomes_base")
        ));

        let mut config = with_fusion_keys(config);
        config.fusion.insert("arriba_ref".into(), "/refs/arriba".into());
        let job = build_one(config);

        assert_eq!(job.label, "nf-core/rnafusion");
        assert!(job.args.contains(&"--all".to_string()));
        let arriba = position(&job.args, "--arriba_ref");
        assert_eq!(job.args[arriba + 1], "/refs/arriba");
        let outdir = position(&job.args, "--outdir");
        assert_eq!(PathBuf::from(&job.args[outdir + 1]), job.output_dir);
    }

    #[test]
    fn validate_checks_every_pipeline_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("results");

        let err = NextflowBuilder::new(PipelineConfig::default())
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Pipeline(BuildError::MissingKey("pipeline.nextflow"))
        ));

        // rnafusion is listed by default but its keys are absent
        let mut config = rnaseq_config(&results);
        config.pipelines = PipelineConfig::default().pipelines;
        let err = NextflowBuilder::new(config.clone()).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Pipeline(BuildError::MissingKey("pipeline.fusion.genomes_base"))
        ));

        NextflowBuilder::new(with_fusion_keys(config)).validate().unwrap();
        assert!(!results.exists());
    }

    #[test]
    fn three_files_in_a_group_is_unsupported() {
        let mut c = candidate();
        c.input_groups[1].paths = vec![
            PathBuf::from("/a"),
            PathBuf::from("/b"),
            PathBuf::from("/c"),
        ];
        let err = samplesheet_contents(&c, "auto").unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedLayout { files: 3, .. }));
    }
}

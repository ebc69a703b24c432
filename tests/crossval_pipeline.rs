use ndarray::{Array2, array};
use ndarray_linalg::{Eigh, UPLO};
use pcmfit::config::{self, FitAlgorithm, FitConfig};
use pcmfit::crossval::{NoopProgress, fit_crossval, fit_group};
use pcmfit::data::load_subject;
use pcmfit::model::Model;
use pcmfit::preprocess::{SubjectData, SubjectStats, preprocess_subject};
use pcmfit::second_moment::ConditionDesign;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::fmt::Write as _;
use std::fs;

const CONDITIONS: usize = 4;
const PARTITIONS: usize = 3;
const CHANNELS: usize = 40;

/// Activity with condition patterns drawn from `true_g`, a random offset per
/// partition and white noise.
fn simulate(id: &str, true_g: &Array2<f64>, seed: u64) -> SubjectData {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let root = true_g
        .eigh(UPLO::Lower)
        .map(|(vals, vecs)| &vecs * &vals.mapv(|v| v.max(0.0).sqrt()))
        .unwrap();
    let white = Array2::from_shape_fn((CONDITIONS, CHANNELS), |_| normal.sample(&mut rng));
    let patterns = root.dot(&white);

    let n = CONDITIONS * PARTITIONS;
    let mut activity = Array2::zeros((n, CHANNELS));
    let mut partition = Vec::with_capacity(n);
    let mut condition = Vec::with_capacity(n);
    for p in 0..PARTITIONS {
        let offsets: Vec<f64> = (0..CHANNELS).map(|_| 0.4 * normal.sample(&mut rng)).collect();
        for c in 0..CONDITIONS {
            let row = p * CONDITIONS + c;
            partition.push(p + 1);
            condition.push(c + 1);
            for ch in 0..CHANNELS {
                activity[[row, ch]] =
                    patterns[[c, ch]] + offsets[ch] + 0.8 * normal.sample(&mut rng);
            }
        }
    }
    SubjectData {
        id: id.to_string(),
        activity,
        partition,
        conditions: ConditionDesign::Labels(condition),
        first_level: None,
    }
}

fn true_g() -> Array2<f64> {
    array![
        [1.0, 0.8, 0.0, 0.0],
        [0.8, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.8],
        [0.0, 0.0, 0.8, 1.0]
    ]
}

fn subjects(seeds: &[u64]) -> Vec<SubjectStats> {
    seeds
        .iter()
        .enumerate()
        .map(|(i, &seed)| preprocess_subject(&simulate(&format!("s{}", i + 1), &true_g(), seed)).unwrap())
        .collect()
}

#[test]
fn two_subjects_fixed_and_free_direct() {
    let subjects = subjects(&[11, 12]);
    let models = vec![
        Model::fixed("null", vec![Array2::eye(CONDITIONS)]).unwrap(),
        Model::free_direct("ceiling"),
    ];
    let report = fit_crossval(&subjects, &models, &FitConfig::default(), &NoopProgress).unwrap();

    let likelihoods = report.likelihood_matrix();
    assert_eq!(likelihoods.dim(), (2, 2));
    assert!(likelihoods.iter().all(|v| v.is_finite()));

    for s in 0..2 {
        assert_eq!(report.cell(s, 0).iterations_train, 0);
        let g = &report.cell(s, 1).predicted_g;
        let (eigvals, _) = g.eigh(UPLO::Lower).unwrap();
        assert!(eigvals.iter().all(|&l| l > -1e-10), "not PSD: {eigvals}");
    }
}

#[test]
fn structured_model_beats_null_model() {
    let subjects = subjects(&[21, 22, 23, 24]);
    let block = true_g();
    let models = vec![
        Model::fixed("null", vec![Array2::eye(CONDITIONS)]).unwrap(),
        Model::component("block", vec![block]).unwrap(),
    ];
    let report = fit_crossval(&subjects, &models, &FitConfig::default(), &NoopProgress).unwrap();
    let likelihoods = report.likelihood_matrix();
    let null: f64 = likelihoods.column(0).sum();
    let block: f64 = likelihoods.column(1).sum();
    assert!(block > null, "block {block} <= null {null}");

    for cell in report.cells.iter().filter(|c| c.model == "block") {
        assert!(cell.train_likelihood.is_some());
        assert!(cell.iterations_train > 0);
        assert!(cell.optimizer_train.is_some());
    }
}

#[test]
fn newton_raphson_primary_gives_same_scores() {
    let subjects = subjects(&[31, 32, 33]);
    let models = vec![Model::component("block", vec![true_g()]).unwrap()];
    let bfgs = fit_crossval(&subjects, &models, &FitConfig::default(), &NoopProgress).unwrap();
    let newton = fit_crossval(
        &subjects,
        &models,
        &FitConfig {
            fit_algorithm: FitAlgorithm::NewtonRaphson,
            ..FitConfig::default()
        },
        &NoopProgress,
    )
    .unwrap();
    for (a, b) in bfgs.cells.iter().zip(&newton.cells) {
        assert!((a.likelihood - b.likelihood).abs() < 1e-2 * a.likelihood.abs().max(1.0));
    }
}

#[test]
fn study_files_drive_group_and_crossval() {
    let dir = tempfile::tempdir().unwrap();
    let mut study = String::from("[fit]\nrun_effect = \"random\"\n\n");
    for (i, seed) in [41_u64, 42, 43].iter().enumerate() {
        let data = simulate(&format!("s{}", i + 1), &true_g(), *seed);
        let mut tsv = String::from("partition\tcondition");
        for ch in 0..CHANNELS {
            write!(tsv, "\tv{ch}").unwrap();
        }
        tsv.push('\n');
        for (row, values) in data.activity.rows().into_iter().enumerate() {
            let labels = match &data.conditions {
                ConditionDesign::Labels(l) => l[row],
                ConditionDesign::Matrix(_) => unreachable!(),
            };
            write!(tsv, "{}\t{}", data.partition[row], labels).unwrap();
            for v in values {
                write!(tsv, "\t{v}").unwrap();
            }
            tsv.push('\n');
        }
        let file = format!("s{}.tsv", i + 1);
        fs::write(dir.path().join(&file), tsv).unwrap();
        write!(study, "[[subjects]]\nid = \"s{}\"\ndata = \"{file}\"\n\n", i + 1).unwrap();
    }
    study.push_str(
        "[[models]]\nkind = \"fixed\"\nname = \"null\"\n\
         instances = [[[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]]]\n\n\
         [[models]]\nkind = \"feature\"\nname = \"pairs\"\n\
         features = [[[1.0], [1.0], [0.0], [0.0]], [[0.0], [0.0], [1.0], [1.0]]]\n",
    );
    let study_path = dir.path().join("study.toml");
    fs::write(&study_path, study).unwrap();

    let mut study = config::load_study(&study_path).unwrap();
    let stats: Vec<SubjectStats> = study
        .subjects
        .iter()
        .map(|entry| preprocess_subject(&load_subject(&entry.id, &entry.data).unwrap()).unwrap())
        .collect();

    let group = fit_group(&stats, &study.models, &study.config).unwrap();
    let theta_path = dir.path().join("group_theta.toml");
    let names: Vec<String> = group.iter().map(|g| g.model.clone()).collect();
    let thetas: Vec<_> = group.iter().map(|g| g.theta.clone()).collect();
    config::save_group_theta(&theta_path, &names, &thetas).unwrap();

    study.config.group_theta = Some(config::load_group_theta(&theta_path, &study.models).unwrap());
    let report = fit_crossval(&stats, &study.models, &study.config, &NoopProgress).unwrap();
    assert_eq!(report.likelihood_matrix().dim(), (3, 2));

    let out = dir.path().join("report.tsv");
    report.write_tsv(&out).unwrap();
    assert_eq!(fs::read_to_string(out).unwrap().lines().count(), 1 + 3 * 2);
}

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use isgvip::base::FamilyPredictor;
use isgvip::encoder::{CategoricalEncoder, HandleUnknown};
use isgvip::meta::batch_zscore;
use isgvip::model::{FittedModel, MissingType, TreeEnsemble, TreeNode};
use isgvip::types::{FeatureFrame, ModelFamily};
use ndarray::Array2;

const N_GENES: usize = 200;

fn gene_names() -> Vec<String> {
    (0..N_GENES).map(|g| format!("GENE{g}")).collect()
}

/// Deterministic pseudo-expression values in roughly [-3, 3].
fn feature_frame(n_samples: usize) -> FeatureFrame {
    let species = ["Homo sapiens", "Mus musculus", "Myotis lucifugus", "Felis catus"];
    FeatureFrame {
        sample_ids: (0..n_samples).map(|i| format!("S{i}")).collect(),
        numeric_names: gene_names(),
        numeric: Array2::from_shape_fn((n_samples, N_GENES), |(i, g)| {
            3.0 * ((i * 31 + g * 17) as f64 * 0.618).sin()
        }),
        categorical_names: vec!["h_species".into(), "order".into()],
        categorical: vec![
            (0..n_samples)
                .map(|i| Some(species[i % species.len()].to_string()))
                .collect(),
            (0..n_samples).map(|_| None).collect(),
        ],
    }
}

/// A balanced tree of the given depth splitting on a rotating gene.
fn tree(depth: usize, seed: usize) -> TreeNode {
    if depth == 0 {
        return TreeNode::Leaf {
            value: ((seed as f64) * 0.37).sin() * 0.1,
        };
    }
    TreeNode::Split {
        feature: (seed * 7 + depth) % N_GENES,
        threshold: ((seed + depth) as f64 * 0.29).cos(),
        missing_type: MissingType::None,
        default_left: seed % 2 == 0,
        left: Box::new(tree(depth - 1, seed * 2 + 1)),
        right: Box::new(tree(depth - 1, seed * 2 + 2)),
    }
}

fn benchmark_fold_inference(c: &mut Criterion) {
    let model = FittedModel::GradientBoosting(TreeEnsemble {
        feature_names: gene_names(),
        trees: (0..100).map(|t| tree(6, t)).collect(),
        init_score: 0.0,
        sigmoid: 1.0,
    });
    let encoder = CategoricalEncoder {
        columns: vec!["h_species".into(), "order".into()],
        categories: vec![
            vec!["Homo sapiens".into(), "Mus musculus".into(), "unknown".into()],
            vec!["Primates".into(), "Rodentia".into(), "unknown".into()],
        ],
        handle_unknown: HandleUnknown::Error,
    };
    let predictor = FamilyPredictor {
        family: ModelFamily::Lgb,
        fold: 0,
        encoder: &encoder,
        model: &model,
        threshold: 0.5,
    };

    let mut group = c.benchmark_group("fold_inference");
    for n_samples in [100_usize, 1000] {
        let frame = feature_frame(n_samples);
        group.throughput(Throughput::Elements(n_samples as u64));

        group.bench_with_input(BenchmarkId::new("tree_family", n_samples), &frame, |b, input| {
            b.iter(|| {
                let predictions = predictor.predict(black_box(input)).expect("prediction");
                black_box(predictions);
            });
        });

        group.bench_with_input(
            BenchmarkId::new("batch_zscore", n_samples),
            &frame,
            |b, input| {
                b.iter(|| {
                    let z = batch_zscore(black_box(input.numeric.column(0)));
                    black_box(z);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(fold_inference, benchmark_fold_inference);
criterion_main!(fold_inference);

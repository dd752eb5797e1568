use std::sync::Arc;

use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use symjoin_core::{
    CollationSeq, ColumnEq, ExprDone, FnProjection, FnQual, HashBuild, HashJoin, HashJoinPlan,
    HashNode, HashTableConfig, JoinError, JoinPhase, JoinType, MemoryIO, Row, TempFileIO,
    ValuesNode, Value, IO,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .try_init();
}

pub fn rng_from_time_or_env() -> (ChaCha8Rng, u64) {
    let seed = std::env::var("SEED").map_or(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis(),
        |v| {
            v.parse()
                .expect("Failed to parse SEED environment variable as u64")
        },
    );
    let rng = ChaCha8Rng::seed_from_u64(seed as u64);
    (rng, seed as u64)
}

/// How the join's tables are configured and where they spill.
struct Setup {
    name: &'static str,
    config: HashTableConfig,
    io: Arc<dyn IO>,
    _dir: Option<tempfile::TempDir>,
}

fn setups() -> Vec<Setup> {
    let dir = tempfile::tempdir().unwrap();
    let disk: Arc<dyn IO> = Arc::new(TempFileIO::in_dir(dir.path()));
    vec![
        Setup {
            name: "single-batch",
            config: HashTableConfig::default(),
            io: Arc::new(MemoryIO::new()),
            _dir: None,
        },
        Setup {
            name: "memory-spill",
            config: HashTableConfig {
                initial_buckets: 16,
                mem_budget: 2 * 1024,
                max_batches: 8,
                ..Default::default()
            },
            io: Arc::new(MemoryIO::new()),
            _dir: None,
        },
        Setup {
            name: "disk-spill",
            config: HashTableConfig {
                initial_buckets: 8,
                mem_budget: 1024,
                max_batches: 32,
                ..Default::default()
            },
            io: disk,
            _dir: Some(dir),
        },
    ]
}

/// Rows of `(key, payload)`; roughly one key in twenty is NULL.
fn random_rows(rng: &mut ChaCha8Rng, n: usize, keys: i64) -> Vec<Row> {
    (0..n)
        .map(|i| {
            let key = if rng.gen_ratio(1, 20) {
                Value::Null
            } else {
                Value::Integer(rng.gen_range(0..keys))
            };
            Row::new(vec![key, Value::Integer(i as i64)])
        })
        .collect()
}

fn node(rows: &[Row]) -> ValuesNode {
    ValuesNode::new(2, rows.to_vec())
}

fn build(
    plan: HashJoinPlan,
    outer: ValuesNode,
    inner: ValuesNode,
    setup: &Setup,
) -> HashJoin {
    HashJoin::new(
        plan.with_config(setup.config.clone()),
        Box::new(HashNode::new(outer, vec![0])),
        Box::new(HashNode::new(inner, vec![0])),
        setup.io.clone(),
    )
    .unwrap()
}

fn drain(join: &mut HashJoin) -> Vec<Row> {
    let mut rows = Vec::new();
    while let Some(row) = join.next().unwrap() {
        rows.push(row);
    }
    rows
}

fn sorted(rows: &[Row]) -> Vec<String> {
    let mut out: Vec<String> = rows.iter().map(|r| format!("{:?}", r.values())).collect();
    out.sort();
    out
}

fn keys_match(a: &Row, b: &Row) -> bool {
    match (a.get(0), b.get(0)) {
        (Some(Value::Integer(x)), Some(Value::Integer(y))) => x == y,
        _ => false,
    }
}

fn concat(a: &Row, b: &Row) -> Row {
    let mut values = a.values().to_vec();
    values.extend_from_slice(b.values());
    Row::new(values)
}

/// Nested-loop reference for inner and left joins.
fn oracle(
    join_type: JoinType,
    outer: &[Row],
    inner: &[Row],
    residual: impl Fn(&Row, &Row) -> bool,
) -> Vec<Row> {
    let mut out = Vec::new();
    for o in outer {
        let mut matched = false;
        for i in inner {
            if keys_match(o, i) {
                matched = true;
                if residual(o, i) {
                    out.push(concat(o, i));
                }
            }
        }
        let null_row = Row::null(2);
        if join_type == JoinType::Left && !matched && residual(o, &null_row) {
            out.push(concat(o, &null_row));
        }
    }
    out
}

#[test]
fn test_concrete_scenario() {
    init_tracing();
    let outer = vec![
        Row::new(vec![Value::Integer(1), Value::build_text("a")]),
        Row::new(vec![Value::Integer(2), Value::build_text("b")]),
    ];
    let inner = vec![
        Row::new(vec![Value::Integer(2), Value::build_text("x")]),
        Row::new(vec![Value::Integer(3), Value::build_text("y")]),
    ];
    for setup in setups() {
        let mut join = build(
            HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]),
            node(&outer),
            node(&inner),
            &setup,
        );
        assert_eq!(
            join.next().unwrap(),
            Some(Row::new(vec![
                Value::Integer(2),
                Value::build_text("b"),
                Value::Integer(2),
                Value::build_text("x"),
            ])),
            "{}",
            setup.name
        );
        assert_eq!(join.next().unwrap(), None, "{}", setup.name);
        assert_eq!(join.next().unwrap(), None, "{}", setup.name);
        assert_eq!(join.phase(), JoinPhase::Done);
    }
}

#[test]
fn test_inner_join_matches_nested_loop() {
    init_tracing();
    let (mut rng, seed) = rng_from_time_or_env();
    println!("seed: {seed}");
    for setup in setups() {
        for _ in 0..5 {
            let n_outer = rng.gen_range(0..300);
            let n_inner = rng.gen_range(0..300);
            let keys = rng.gen_range(1..60);
            let outer = random_rows(&mut rng, n_outer, keys);
            let inner = random_rows(&mut rng, n_inner, keys);
            let mut join = build(
                HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]),
                node(&outer),
                node(&inner),
                &setup,
            );
            let got = drain(&mut join);
            let expected = oracle(JoinType::Inner, &outer, &inner, |_, _| true);
            assert_eq!(
                sorted(&got),
                sorted(&expected),
                "setup {} seed {seed}",
                setup.name
            );
        }
    }
}

#[test]
fn test_spilling_setups_actually_spill() {
    init_tracing();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let outer = random_rows(&mut rng, 400, 40);
    let inner = random_rows(&mut rng, 400, 40);
    for setup in setups().into_iter().skip(1) {
        let mut join = build(
            HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]),
            node(&outer),
            node(&inner),
            &setup,
        );
        let got = drain(&mut join);
        let metrics = join.metrics();
        assert!(metrics.batch_growths > 0, "{}: {metrics}", setup.name);
        assert!(metrics.rows_spilled > 0, "{}", setup.name);
        assert!(metrics.batches_loaded > 0, "{}", setup.name);
        assert!(metrics.batch_probe_rows > 0, "{}", setup.name);
        assert_eq!(metrics.rows_emitted(), got.len() as u64);
        assert_eq!(join.inner_table().batch_count(), join.outer_table().batch_count());
        let expected = oracle(JoinType::Inner, &outer, &inner, |_, _| true);
        assert_eq!(sorted(&got), sorted(&expected), "{}", setup.name);
    }
}

#[test]
fn test_output_independent_of_input_order() {
    init_tracing();
    let (mut rng, seed) = rng_from_time_or_env();
    let mut outer = random_rows(&mut rng, 200, 25);
    let mut inner = random_rows(&mut rng, 150, 25);
    for setup in setups() {
        let mut join = build(
            HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]),
            node(&outer),
            node(&inner),
            &setup,
        );
        let first = sorted(&drain(&mut join));
        outer.shuffle(&mut rng);
        inner.shuffle(&mut rng);
        let mut join = build(
            HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]),
            node(&outer),
            node(&inner),
            &setup,
        );
        assert_eq!(sorted(&drain(&mut join)), first, "setup {} seed {seed}", setup.name);
    }
}

#[test]
fn test_residual_predicate() {
    init_tracing();
    let (mut rng, seed) = rng_from_time_or_env();
    let residual = |o: &Row, i: &Row| o.get(1).and_then(Value::as_int) < i.get(1).and_then(Value::as_int);
    for setup in setups() {
        let outer = random_rows(&mut rng, 250, 30);
        let inner = random_rows(&mut rng, 250, 30);
        let plan = HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]).with_other_qual(
            FnQual::new(|ctx| Ok(ctx.outer_column(1)?.as_int() < ctx.inner_column(1)?.as_int())),
        );
        let mut join = build(plan, node(&outer), node(&inner), &setup);
        let got = drain(&mut join);
        let expected = oracle(JoinType::Inner, &outer, &inner, residual);
        assert_eq!(sorted(&got), sorted(&expected), "setup {} seed {seed}", setup.name);
    }
}

/// `outer.1 < inner.1`; against a null inner row, true for even outer payloads.
fn payload_residual(o: &Row, i: &Row) -> bool {
    match (o.get(1).and_then(Value::as_int), i.get(1).and_then(Value::as_int)) {
        (Some(a), Some(b)) => a < b,
        (Some(a), None) => a % 2 == 0,
        _ => false,
    }
}

#[test]
fn test_left_join_with_residual_predicate() {
    init_tracing();
    let (mut rng, seed) = rng_from_time_or_env();
    for setup in setups() {
        for _ in 0..3 {
            let outer = random_rows(&mut rng, 250, 40);
            let inner = random_rows(&mut rng, 200, 40);
            let plan = HashJoinPlan::equi_join(JoinType::Left, &[(0, 0)]).with_other_qual(
                FnQual::new(|ctx| Ok(payload_residual(ctx.outer, ctx.inner))),
            );
            let mut join = build(plan, node(&outer), node(&inner), &setup);
            let got = drain(&mut join);
            let expected = oracle(JoinType::Left, &outer, &inner, payload_residual);
            assert_eq!(sorted(&got), sorted(&expected), "setup {} seed {seed}", setup.name);
        }
    }
}

#[test]
fn test_semi_join_with_residual_predicate() {
    init_tracing();
    let (mut rng, seed) = rng_from_time_or_env();
    for setup in setups() {
        for _ in 0..3 {
            let mut outer = random_rows(&mut rng, 250, 30);
            let mut inner = random_rows(&mut rng, 250, 30);
            let expected: Vec<Row> = outer
                .iter()
                .filter(|o| {
                    inner
                        .iter()
                        .any(|i| keys_match(o, i) && payload_residual(o, i))
                })
                .cloned()
                .collect();
            for _ in 0..2 {
                let plan = HashJoinPlan::equi_join(JoinType::Semi, &[(0, 0)])
                    .with_other_qual(FnQual::new(|ctx| Ok(payload_residual(ctx.outer, ctx.inner))))
                    .with_projection(FnProjection::new(|ctx| {
                        Ok(ExprDone::Single(ctx.outer.clone()))
                    }));
                let mut join = build(plan, node(&outer), node(&inner), &setup);
                let got = drain(&mut join);
                assert_eq!(sorted(&got), sorted(&expected), "setup {} seed {seed}", setup.name);
                outer.shuffle(&mut rng);
                inner.shuffle(&mut rng);
            }
        }
    }
}

#[test]
fn test_left_join_null_extends_unmatched_rows_once() {
    init_tracing();
    let (mut rng, seed) = rng_from_time_or_env();
    for setup in setups() {
        let outer = random_rows(&mut rng, 300, 80);
        let inner = random_rows(&mut rng, 120, 80);
        let mut join = build(
            HashJoinPlan::equi_join(JoinType::Left, &[(0, 0)]),
            node(&outer),
            node(&inner),
            &setup,
        );
        let got = drain(&mut join);
        let expected = oracle(JoinType::Left, &outer, &inner, |_, _| true);
        assert_eq!(sorted(&got), sorted(&expected), "setup {} seed {seed}", setup.name);

        let unmatched = outer
            .iter()
            .filter(|o| !inner.iter().any(|i| keys_match(o, i)))
            .count();
        assert_eq!(join.metrics().null_extended_rows, unmatched as u64);
    }
}

#[test]
fn test_left_join_with_empty_inner() {
    let outer = vec![
        Row::new(vec![Value::Integer(1), Value::Integer(10)]),
        Row::new(vec![Value::Null, Value::Integer(11)]),
    ];
    let setup = &setups()[0];
    let mut join = build(
        HashJoinPlan::equi_join(JoinType::Left, &[(0, 0)]),
        node(&outer),
        node(&[]),
        setup,
    );
    let got = drain(&mut join);
    assert_eq!(got.len(), 2);
    assert!(got
        .iter()
        .all(|r| r.get(2) == Some(&Value::Null) && r.get(3) == Some(&Value::Null)));
}

#[test]
fn test_semi_join_at_most_one_row_per_outer_row() {
    init_tracing();
    let (mut rng, seed) = rng_from_time_or_env();
    for setup in setups() {
        let outer = random_rows(&mut rng, 300, 40);
        let inner = random_rows(&mut rng, 300, 40);
        let plan = HashJoinPlan::equi_join(JoinType::Semi, &[(0, 0)])
            .with_projection(FnProjection::new(|ctx| Ok(ExprDone::Single(ctx.outer.clone()))));
        let mut join = build(plan, node(&outer), node(&inner), &setup);
        let got = drain(&mut join);
        let expected: Vec<Row> = outer
            .iter()
            .filter(|o| inner.iter().any(|i| keys_match(o, i)))
            .cloned()
            .collect();
        assert_eq!(sorted(&got), sorted(&expected), "setup {} seed {seed}", setup.name);
    }
}

#[test]
fn test_nocase_collation_keys() {
    let text_rows = |words: &[&str]| -> Vec<Row> {
        words
            .iter()
            .enumerate()
            .map(|(i, w)| Row::new(vec![Value::build_text(*w), Value::Integer(i as i64)]))
            .collect()
    };
    let outer = text_rows(&["Apple", "banana", "CHERRY"]);
    let inner = text_rows(&["apple", "BANANA", "durian", "cherry"]);
    let config = HashTableConfig {
        collations: vec![CollationSeq::NoCase],
        ..Default::default()
    };
    let plan = HashJoinPlan::new(JoinType::Inner)
        .with_join_qual(ColumnEq::new(0, 0).with_collation(CollationSeq::NoCase))
        .with_config(config);
    let mut join = HashJoin::new(
        plan,
        Box::new(HashNode::new(node(&outer), vec![0])),
        Box::new(HashNode::new(node(&inner), vec![0])),
        Arc::new(MemoryIO::new()),
    )
    .unwrap();
    assert_eq!(drain(&mut join).len(), 3);
}

#[test]
fn test_rescan_reuses_single_batch_inner_table() {
    init_tracing();
    let (mut rng, _) = rng_from_time_or_env();
    let outer_rows = random_rows(&mut rng, 100, 20);
    let inner_rows = random_rows(&mut rng, 100, 20);
    let outer = node(&outer_rows);
    let inner = node(&inner_rows);
    let (outer_ctl, inner_ctl) = (outer.control(), inner.control());
    let setup = &setups()[0];
    let mut join = build(
        HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]),
        outer,
        inner,
        setup,
    );
    let first = sorted(&drain(&mut join));
    let inner_fetches = inner_ctl.fetches();
    assert_eq!(inner_fetches, inner_rows.len() + 1);

    join.rescan().unwrap();
    assert_eq!(outer_ctl.rescans(), 1);
    assert_eq!(inner_ctl.rescans(), 0);
    let second = sorted(&drain(&mut join));
    assert_eq!(inner_ctl.fetches(), inner_fetches);
    assert_eq!(second, first);
    assert_eq!(join.inner_table().len(), inner_rows.len());
}

#[test]
fn test_rescan_rebuilds_after_inner_param_change() {
    let outer_rows: Vec<Row> = (0..10)
        .map(|i| Row::new(vec![Value::Integer(i), Value::Integer(i)]))
        .collect();
    let inner_rows: Vec<Row> = (0..5)
        .map(|i| Row::new(vec![Value::Integer(i), Value::Integer(100 + i)]))
        .collect();
    let replacement: Vec<Row> = (5..10)
        .map(|i| Row::new(vec![Value::Integer(i), Value::Integer(200 + i)]))
        .collect();
    let outer = node(&outer_rows);
    let inner = node(&inner_rows);
    let (outer_ctl, inner_ctl) = (outer.control(), inner.control());
    let setup = &setups()[0];
    let mut join = build(
        HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]),
        outer,
        inner,
        setup,
    );
    assert_eq!(drain(&mut join).len(), 5);

    inner_ctl.change_params(Some(replacement.clone()));
    join.rescan().unwrap();
    // the inner child restarts itself on its next fetch
    assert_eq!(inner_ctl.rescans(), 0);
    assert_eq!(outer_ctl.rescans(), 1);
    assert_eq!(join.inner_table().len(), 0);

    let got = drain(&mut join);
    let expected = oracle(JoinType::Inner, &outer_rows, &replacement, |_, _| true);
    assert_eq!(sorted(&got), sorted(&expected));
}

#[test]
fn test_rescan_mid_stream_rebuilds_inner_table() {
    let rows: Vec<Row> = (0..50)
        .map(|i| Row::new(vec![Value::Integer(i % 10), Value::Integer(i)]))
        .collect();
    let outer = node(&rows);
    let inner = node(&rows);
    let inner_ctl = inner.control();
    let setup = &setups()[0];
    let mut join = build(
        HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]),
        outer,
        inner,
        setup,
    );
    let full = {
        let mut rows = Vec::new();
        for _ in 0..3 {
            rows.push(join.next().unwrap().unwrap());
        }
        rows
    };
    assert_eq!(full.len(), 3);
    join.rescan().unwrap();
    assert_eq!(inner_ctl.rescans(), 1);
    let got = drain(&mut join);
    let expected = oracle(JoinType::Inner, &rows, &rows, |_, _| true);
    assert_eq!(sorted(&got), sorted(&expected));
}

#[test]
fn test_rescan_is_deterministic_with_spilling() {
    init_tracing();
    let (mut rng, seed) = rng_from_time_or_env();
    for setup in setups() {
        let outer = random_rows(&mut rng, 300, 30);
        let inner = random_rows(&mut rng, 300, 30);
        let mut join = build(
            HashJoinPlan::equi_join(JoinType::Left, &[(0, 0)]),
            node(&outer),
            node(&inner),
            &setup,
        );
        let first = sorted(&drain(&mut join));
        for _ in 0..2 {
            join.rescan().unwrap();
            assert_eq!(sorted(&drain(&mut join)), first, "setup {} seed {seed}", setup.name);
        }
    }
}

#[test]
fn test_short_spill_write_aborts_join() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let outer = random_rows(&mut rng, 300, 30);
    let inner = random_rows(&mut rng, 300, 30);
    let config = HashTableConfig {
        initial_buckets: 8,
        mem_budget: 1024,
        max_batches: 8,
        ..Default::default()
    };
    let mut join = HashJoin::new(
        HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]).with_config(config),
        Box::new(HashNode::new(node(&outer), vec![0])),
        Box::new(HashNode::new(node(&inner), vec![0])),
        Arc::new(MemoryIO::with_file_capacity(64)),
    )
    .unwrap();
    let err = loop {
        match join.next() {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("join finished without hitting the spill limit"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, JoinError::ShortWrite { .. }), "{err}");
    assert!(err.is_io());
}

#[test]
fn test_drop_removes_spill_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let outer = random_rows(&mut rng, 300, 30);
    let inner = random_rows(&mut rng, 300, 30);
    let config = HashTableConfig {
        initial_buckets: 8,
        mem_budget: 1024,
        max_batches: 8,
        ..Default::default()
    };
    let outer_input: Box<dyn HashBuild> = Box::new(HashNode::new(node(&outer), vec![0]));
    let inner_input: Box<dyn HashBuild> = Box::new(HashNode::new(node(&inner), vec![0]));
    let mut join = HashJoin::new(
        HashJoinPlan::equi_join(JoinType::Inner, &[(0, 0)]).with_config(config),
        outer_input,
        inner_input,
        Arc::new(TempFileIO::in_dir(dir.path())),
    )
    .unwrap();
    for _ in 0..50 {
        join.next().unwrap();
    }
    assert!(join.metrics().rows_spilled > 0);
    assert!(std::fs::read_dir(dir.path()).unwrap().count() > 0);
    drop(join);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

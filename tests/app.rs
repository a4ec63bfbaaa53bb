use std::fs;
use std::path::{Path, PathBuf};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use kira_expression_matrix::app::App;
use kira_expression_matrix::domain::{CellRef, SimilarityMetric};
use kira_expression_matrix::error::KiraError;
use kira_expression_matrix::lsh::LshOptions;
use kira_expression_matrix::output::JsonOutput;
use kira_expression_matrix::similarity::{CancelToken, SimilarityOptions};

struct Fixture {
    _temp: tempfile::TempDir,
    dir: Utf8PathBuf,
    counts: PathBuf,
    metadata: PathBuf,
}

fn fixture(counts: &str, metadata: &str) -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let counts_path = temp.path().join("ExpressionMatrix.csv");
    let metadata_path = temp.path().join("MetaData.csv");
    fs::write(&counts_path, counts).unwrap();
    fs::write(&metadata_path, metadata).unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap();
    Fixture {
        _temp: temp,
        dir,
        counts: counts_path,
        metadata: metadata_path,
    }
}

fn toy() -> Fixture {
    fixture(
        "Gene,A,B,C\ng1,1,1,0\ng2,0,0,1\n",
        "CellName,Type\nA,alpha\nB,alpha\nC,beta\n",
    )
}

fn ingest(fixture: &Fixture) -> App {
    let mut app = App::open(fixture.dir.clone()).unwrap();
    app.add_cells(&fixture.counts, &fixture.metadata, &JsonOutput)
        .unwrap();
    app
}

fn find(app: &App, name: &str) -> Result<kira_expression_matrix::app::FindPairsResult, KiraError> {
    app.find_similar_pairs0(
        name,
        &SimilarityOptions::default(),
        &CancelToken::new(),
        &JsonOutput,
    )
}

#[test]
fn toy_scenario_exact_pairs() {
    let fixture = toy();
    let app = ingest(&fixture);

    let result = find(&app, "Exact").unwrap();
    assert_eq!(result.pairs_scored, 3);
    assert_eq!(result.pairs_stored, 3);

    let pairs = app.similar_pairs("Exact").unwrap();
    assert_eq!(pairs.len(), 3);
    assert_eq!(pairs.metric, SimilarityMetric::Cosine);
    assert_eq!(pairs.score(0, 1), Some(1.0));
    assert_eq!(pairs.score(0, 2), Some(0.0));
    assert_eq!(pairs.score(1, 2), Some(0.0));
}

#[test]
fn ingested_cells_resolve_by_id_and_name() {
    let fixture = toy();
    let app = ingest(&fixture);
    assert_eq!(app.cell_count(), 3);
    assert_eq!(app.gene_count(), 2);

    for (id, name) in ["A", "B", "C"].iter().enumerate() {
        let by_id = app.cell(&CellRef::Id(id as u32)).unwrap();
        let by_name = app.cell(&CellRef::Name(name.to_string())).unwrap();
        assert_eq!(by_id, by_name);
        assert_eq!(by_id.name, *name);
    }
    let c = app.cell(&"C".parse().unwrap()).unwrap();
    assert_eq!(c.metadata, vec![("Type".to_string(), "beta".to_string())]);
    assert_eq!(app.gene_id("g2"), Some(1));
    assert_eq!(app.gene_name(0), Some("g1"));
    assert_matches!(app.cell(&CellRef::Id(3)), Err(KiraError::CellNotFound(_)));
    assert_matches!(
        app.cell(&CellRef::Name("Z".to_string())),
        Err(KiraError::CellNotFound(_))
    );
}

#[test]
fn duplicate_name_fails_and_keeps_first_result() {
    let fixture = toy();
    let app = ingest(&fixture);
    find(&app, "Exact").unwrap();
    let first = app.similar_pairs("Exact").unwrap();
    let bytes = fs::read(app.store().pairs_path(&"Exact".parse().unwrap())).unwrap();

    let options = SimilarityOptions {
        metric: SimilarityMetric::Jaccard,
        ..SimilarityOptions::default()
    };
    assert_matches!(
        app.find_similar_pairs0("Exact", &options, &CancelToken::new(), &JsonOutput),
        Err(KiraError::SimilarPairsExists(_))
    );
    assert_eq!(app.similar_pairs("Exact").unwrap(), first);
    assert_eq!(
        fs::read(app.store().pairs_path(&"Exact".parse().unwrap())).unwrap(),
        bytes
    );
}

#[test]
fn remove_allows_recreate() {
    let fixture = toy();
    let app = ingest(&fixture);
    find(&app, "Exact").unwrap();
    assert_eq!(app.list_similar_pairs().unwrap(), vec!["Exact"]);

    let removed = app.remove_similar_pairs("Exact", &JsonOutput).unwrap();
    assert!(removed.removed);
    assert!(app.list_similar_pairs().unwrap().is_empty());
    assert_matches!(
        app.remove_similar_pairs("Exact", &JsonOutput),
        Err(KiraError::SimilarPairsNotFound(_))
    );
    find(&app, "Exact").unwrap();
}

#[test]
fn find_on_empty_store_fails() {
    let fixture = toy();
    let app = App::open(fixture.dir.clone()).unwrap();
    assert_matches!(find(&app, "Exact"), Err(KiraError::EmptyInput(_)));
    assert_matches!(find(&app, "bad name"), Err(KiraError::InvalidName(_)));
}

#[test]
fn second_ingestion_is_rejected() {
    let fixture = toy();
    let mut app = ingest(&fixture);
    assert_matches!(
        app.add_cells(&fixture.counts, &fixture.metadata, &JsonOutput),
        Err(KiraError::StoreNotEmpty(3))
    );
}

#[test]
fn parse_error_names_file_and_line_and_writes_nothing() {
    let fixture = fixture(
        "Gene,A,B\ng1,1,2\ng2,1,oops\n",
        "CellName,Type\nA,x\nB,y\n",
    );
    let mut app = App::open(fixture.dir.clone()).unwrap();
    let err = app
        .add_cells(&fixture.counts, &fixture.metadata, &JsonOutput)
        .unwrap_err();
    assert_matches!(
        err,
        KiraError::Parse { ref file, line: 3, .. } if file.ends_with("ExpressionMatrix.csv")
    );
    assert_eq!(app.cell_count(), 0);
    assert!(!app.store().is_initialized());
    assert_only_lock_file(fixture.dir.as_std_path());
}

#[test]
fn metadata_parse_error_names_metadata_file() {
    let fixture = fixture(
        "Gene,A,B\ng1,1,2\n",
        "CellName,Type\nA,x\nB,y,z\n",
    );
    let mut app = App::open(fixture.dir.clone()).unwrap();
    let err = app
        .add_cells(&fixture.counts, &fixture.metadata, &JsonOutput)
        .unwrap_err();
    assert_matches!(
        err,
        KiraError::Parse { ref file, line: 3, .. } if file.ends_with("MetaData.csv")
    );
    assert_eq!(app.cell_count(), 0);
    assert_only_lock_file(fixture.dir.as_std_path());
}

#[test]
fn cancelled_search_persists_nothing() {
    let fixture = toy();
    let app = ingest(&fixture);
    let cancel = CancelToken::new();
    cancel.cancel();
    assert_matches!(
        app.find_similar_pairs0("Exact", &SimilarityOptions::default(), &cancel, &JsonOutput),
        Err(KiraError::Cancelled)
    );
    assert_matches!(
        app.find_similar_pairs_lsh(
            "Approx",
            &SimilarityOptions::default(),
            &LshOptions::default(),
            &cancel,
            &JsonOutput
        ),
        Err(KiraError::Cancelled)
    );
    assert!(app.list_similar_pairs().unwrap().is_empty());
    assert!(!app.store().pairs_dir().as_std_path().exists());
    find(&app, "Exact").unwrap();
}

#[test]
fn orphan_cell_is_integrity_error() {
    let fixture = fixture("Gene,A,B\ng1,1,2\n", "CellName,Type\nA,x\n");
    let mut app = App::open(fixture.dir.clone()).unwrap();
    assert_matches!(
        app.add_cells(&fixture.counts, &fixture.metadata, &JsonOutput),
        Err(KiraError::DataIntegrity(_))
    );
    assert_only_lock_file(fixture.dir.as_std_path());
}

#[test]
fn missing_input_file_is_reported() {
    let fixture = toy();
    let mut app = App::open(fixture.dir.clone()).unwrap();
    let missing = fixture.counts.with_file_name("nope.csv");
    assert_matches!(
        app.add_cells(&missing, &fixture.metadata, &JsonOutput),
        Err(KiraError::FileRead(_))
    );
}

#[test]
fn all_pairs_count_for_larger_matrix() {
    let cells = 17;
    let genes = 23;
    let mut counts = String::from("Gene");
    let mut metadata = String::from("CellName,Index\n");
    for cell in 0..cells {
        counts.push_str(&format!(",cell{cell}"));
        metadata.push_str(&format!("cell{cell},{cell}\n"));
    }
    counts.push('\n');
    for gene in 0..genes {
        counts.push_str(&format!("gene{gene}"));
        for cell in 0..cells {
            let value = (gene * 7 + cell * 3) % 5;
            counts.push_str(&format!(",{value}"));
        }
        counts.push('\n');
    }
    let fixture = fixture(&counts, &metadata);
    let app = ingest(&fixture);

    let result = find(&app, "Exact").unwrap();
    assert_eq!(result.pairs_stored, cells * (cells - 1) / 2);
    let pairs = app.similar_pairs("Exact").unwrap();
    let mut seen = std::collections::HashSet::new();
    for pair in &pairs.pairs {
        assert!(pair.cell_a < pair.cell_b);
        assert!(seen.insert((pair.cell_a, pair.cell_b)));
        assert!((0.0..=1.0).contains(&pair.score));
    }
    assert!(
        pairs
            .pairs
            .windows(2)
            .all(|w| (w[0].cell_a, w[0].cell_b) < (w[1].cell_a, w[1].cell_b))
    );
}

#[test]
fn sets_restrict_the_scan() {
    let fixture = fixture(
        "Gene,A,B,C,D\nMT-1,5,0,1,0\nACTB,1,1,0,1\nGAPDH,0,1,1,1\n",
        "CellName,Type\nA,T\nB,T\nC,B\nD,T\n",
    );
    let mut app = ingest(&fixture);
    assert_eq!(
        app.create_gene_set("Housekeeping", "ACTB|GAPDH", &JsonOutput)
            .unwrap()
            .size,
        2
    );
    assert_eq!(
        app.create_cell_set("TCells", "Type", "T", &JsonOutput)
            .unwrap()
            .size,
        3
    );

    let options = SimilarityOptions {
        gene_set: "Housekeeping".to_string(),
        cell_set: "TCells".to_string(),
        ..SimilarityOptions::default()
    };
    let result = app
        .find_similar_pairs0("Subset", &options, &CancelToken::new(), &JsonOutput)
        .unwrap();
    assert_eq!(result.cell_count, 3);
    assert_eq!(result.pairs_stored, 3);

    let pairs = app.similar_pairs("Subset").unwrap();
    assert_eq!(pairs.gene_set, "Housekeeping");
    assert_eq!(pairs.score(1, 3), Some(1.0));
    assert_eq!(pairs.score(0, 2), None);

    let unknown = SimilarityOptions {
        gene_set: "Nope".to_string(),
        ..SimilarityOptions::default()
    };
    assert_matches!(
        app.find_similar_pairs0("Other", &unknown, &CancelToken::new(), &JsonOutput),
        Err(KiraError::GeneSetNotFound(_))
    );
}

#[test]
fn export_writes_named_rows() {
    let fixture = toy();
    let app = ingest(&fixture);
    find(&app, "Exact").unwrap();
    let output = fixture.dir.join("SimilarPairs-Exact.csv");
    let result = app
        .write_similar_pairs_csv("Exact", &output, &JsonOutput)
        .unwrap();
    assert_eq!(result.rows, 3);
    let content = fs::read_to_string(output.as_std_path()).unwrap();
    assert_eq!(content, "Cell0,Cell1,Similarity\nA,B,1\nA,C,0\nB,C,0\n");
}

#[test]
fn info_summarizes_store() {
    let fixture = toy();
    let app = ingest(&fixture);
    find(&app, "Exact").unwrap();
    let info = app.info().unwrap();
    assert_eq!(info.cell_count, 3);
    assert_eq!(info.gene_count, 2);
    assert_eq!(info.metadata_keys, vec!["Type"]);
    assert_eq!(info.similar_pairs, vec!["Exact"]);
    assert_eq!(info.gene_sets[0].name, "AllGenes");
    assert!(info.created_at.is_some());
}

#[test]
fn neighbors_come_best_first() {
    let fixture = fixture(
        "Gene,A,B,C,D\ng1,1,1,1,0\ng2,0,1,0,1\n",
        "CellName,Type\nA,x\nB,x\nC,y\nD,y\n",
    );
    let app = ingest(&fixture);
    find(&app, "Exact").unwrap();

    let neighbors = app
        .neighbors("Exact", &CellRef::Name("A".to_string()))
        .unwrap();
    let names = neighbors
        .iter()
        .map(|neighbor| neighbor.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["C", "B", "D"]);
    assert_eq!(neighbors[0].id, 2);
    assert_eq!(neighbors[0].score, 1.0);
    assert_matches!(
        app.neighbors("Missing", &CellRef::Id(0)),
        Err(KiraError::SimilarPairsNotFound(_))
    );
    assert_matches!(
        app.neighbors("Exact", &CellRef::Id(9)),
        Err(KiraError::CellNotFound(_))
    );
}

#[test]
fn lsh_search_is_stored_as_named_set() {
    let fixture = toy();
    let app = ingest(&fixture);
    let result = app
        .find_similar_pairs_lsh(
            "Approx",
            &SimilarityOptions::default(),
            &LshOptions::default(),
            &CancelToken::new(),
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(result.pairs_stored, 1);

    let pairs = app.similar_pairs("Approx").unwrap();
    assert_eq!(pairs.lsh, Some(LshOptions::default()));
    assert_eq!(pairs.score(0, 1), Some(1.0));
    assert_eq!(pairs.score(0, 2), None);
    assert_eq!(app.list_similar_pairs().unwrap(), vec!["Approx"]);

    assert_matches!(
        app.find_similar_pairs_lsh(
            "Approx",
            &SimilarityOptions::default(),
            &LshOptions::default(),
            &CancelToken::new(),
            &JsonOutput
        ),
        Err(KiraError::SimilarPairsExists(_))
    );
    let jaccard = SimilarityOptions {
        metric: SimilarityMetric::Jaccard,
        ..SimilarityOptions::default()
    };
    assert_matches!(
        app.find_similar_pairs_lsh(
            "Other",
            &jaccard,
            &LshOptions::default(),
            &CancelToken::new(),
            &JsonOutput
        ),
        Err(KiraError::InvalidOption(_))
    );
}

#[test]
fn lsh_comparison_lists_every_pair() {
    let fixture = toy();
    let app = ingest(&fixture);
    let output = fixture.dir.join("LshSimilarityComparison.csv");
    let result = app
        .write_lsh_comparison_csv(
            &SimilarityOptions::default(),
            &LshOptions::default(),
            &output,
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(result.rows, 3);
    let content = fs::read_to_string(output.as_std_path()).unwrap();
    let lines = content.lines().collect::<Vec<_>>();
    assert_eq!(lines[0], "Cell0,Cell1,Exact,LSH,Delta");
    assert_eq!(lines[1], "A,B,1,1,0");
    assert_eq!(lines.len(), 4);
}

fn assert_only_lock_file(dir: &Path) {
    let names = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert_eq!(names, vec![".lock"]);
}

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use assert_matches::assert_matches;
use flate2::Compression;
use flate2::write::GzEncoder;

use molid::error::MolidError;
use molid::extract::{self, SdfRecords};
use molid::sdf::{parse_properties, parse_record};

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/sample.sdf")
}

#[test]
fn fixture_records_parse() {
    let records = SdfRecords::new(BufReader::new(File::open(fixture()).unwrap()), &fixture())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(records.len(), 3);

    let aspirin = parse_record(&records[0]).unwrap().unwrap();
    assert_eq!(aspirin.cid, Some(2244));
    assert_eq!(aspirin.iupac_name.as_deref(), Some("2-acetyloxybenzoic acid"));
    assert_eq!(aspirin.smiles.as_deref(), Some("CC(=O)OC1=CC=CC=C1C(=O)O"));
    assert_eq!(aspirin.molecular_weight.as_deref(), Some("180.16"));
    assert_eq!(aspirin.inchikey14(), "BSYNRYMUTXBXSQ");

    let benzene = parse_record(&records[1]).unwrap().unwrap();
    assert_eq!(benzene.smiles.as_deref(), Some("C1=CC=CC=C1"));
    assert_eq!(benzene.iupac_name, None);

    assert!(parse_record(&records[2]).unwrap().is_none());
}

#[test]
fn multi_line_values_are_kept() {
    let props = parse_properties(
        "t\n> <PUBCHEM_COORDINATE_TYPE>\n1\n5\n255\n\n> <PUBCHEM_SMILES>\nC\n\n",
    )
    .unwrap();
    assert_eq!(props["PUBCHEM_COORDINATE_TYPE"], "1\n5\n255");
    assert_eq!(props["PUBCHEM_SMILES"], "C");
}

#[test]
fn empty_block_is_malformed() {
    assert_matches!(parse_record("  \n"), Err(MolidError::RecordParse(_)));
}

#[test]
fn gzip_archive_extracts_to_records() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("Compound_sample.sdf.gz");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&std::fs::read(fixture()).unwrap())
        .unwrap();
    std::fs::write(&archive, encoder.finish().unwrap()).unwrap();

    extract::validate_gzip(&archive).unwrap();
    let staging = dir.path().join("staging");
    let blocks = extract::extract(&archive, &staging)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(blocks.len(), 3);

    let staged = extract::staged_path(&archive, &staging);
    assert!(staged.exists());
    extract::cleanup(&[staged.as_path(), archive.as_path()]);
    assert!(!staged.exists());
    assert!(!archive.exists());
}

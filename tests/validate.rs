mod common;

use common::{build, snapshot, snapshot_builder, InProcess, WORD};
use genmeta::{
    abi::instruction,
    buffer::Buffer,
    validate::Difference,
    BuilderConfig, GenericMetadataBuilder, ValidationOutcome, Verbosity,
};
use pretty_assertions::assert_eq;

fn validating() -> BuilderConfig {
    BuilderConfig::new(Verbosity::Summary).with_validation(true)
}

#[test]
fn test_reference_record_matches() {
    let (snapshot, image) = snapshot();
    let mut builder = snapshot_builder(snapshot, validating());
    let outcome = builder
        .validate(
            Buffer::new(image.symbol("expected_maybe_bool").unwrap()),
            Buffer::new(image.symbol("maybe_descriptor").unwrap()),
            &[image.symbol("Sb").unwrap()],
        )
        .unwrap();
    assert_eq!(outcome, ValidationOutcome::Matched);
    outcome.abort_on_mismatch();
}

#[test]
fn test_corrupted_instruction_is_detected() {
    let (mut snapshot, image) = snapshot();
    // Shift the source of the tag copy by one byte.
    let operand = image.symbol("maybe_instructions").unwrap()
        + 3 * instruction::SIZE
        + instruction::OPERAND;
    let mut raw = [0u8; 4];
    snapshot.read(operand, &mut raw).unwrap();
    let shifted = i32::from_le_bytes(raw) + 1;
    assert!(snapshot.write(operand, &shifted.to_le_bytes()));

    let mut builder = snapshot_builder(snapshot, validating());
    let outcome = builder
        .validate(
            Buffer::new(image.symbol("expected_maybe_bool").unwrap()),
            Buffer::new(image.symbol("maybe_descriptor").unwrap()),
            &[image.symbol("Sb").unwrap()],
        )
        .unwrap();
    let diff = match outcome {
        ValidationOutcome::Mismatch(diff) => diff,
        outcome => panic!("expected a mismatch, got {outcome:?}"),
    };

    let tag = b"MAYBETAG";
    let expected: Vec<_> = (0..8)
        .map(|i| Difference::Byte {
            offset: 5 * 8 + i,
            original: tag[i],
            built: tag.get(i + 1).copied().unwrap_or(0),
        })
        .collect();
    assert_eq!(diff.differences, expected);
    assert!(diff
        .to_string()
        .starts_with("8 differences:\n  byte 0x28: original 0x4d, built 0x41\n"));
}

#[test]
fn test_rebuilt_record_matches_in_process() {
    let fixture = InProcess::load();
    let mut builder = fixture.builder();
    let int = fixture.address("Si");
    let descriptor = fixture.address("maybe_descriptor");
    let original = build(&mut builder, descriptor, &[int]).unwrap();

    let mut validator = GenericMetadataBuilder::new(fixture.reader_writer(validating()));
    let outcome = validator
        .validate(original.record(), Buffer::new(descriptor), &[int])
        .unwrap();
    assert_eq!(outcome, ValidationOutcome::Matched);
}

#[test]
fn test_wrong_argument_is_a_mismatch() {
    let fixture = InProcess::load();
    let mut builder = fixture.builder();
    let descriptor = fixture.address("maybe_descriptor");
    let original = build(&mut builder, descriptor, &[fixture.address("Si")]).unwrap();

    let mut validator = GenericMetadataBuilder::new(fixture.reader_writer(validating()));
    let outcome = validator
        .validate(
            original.record(),
            Buffer::new(descriptor),
            &[fixture.address("Sb")],
        )
        .unwrap();
    let diff = match outcome {
        ValidationOutcome::Mismatch(diff) => diff,
        outcome => panic!("expected a mismatch, got {outcome:?}"),
    };
    assert!(diff
        .differences
        .iter()
        .any(|d| matches!(d, Difference::Byte { offset, .. } if *offset == 2 * WORD)));
    assert!(diff
        .differences
        .iter()
        .any(|d| matches!(d, Difference::Witness { .. })));
}

#[test]
fn test_validation_off_by_default() {
    let (snapshot, image) = snapshot();
    let mut builder = snapshot_builder(snapshot, BuilderConfig::default());
    let outcome = builder
        .validate(
            Buffer::new(image.symbol("expected_maybe_bool").unwrap()),
            Buffer::new(image.symbol("maybe_descriptor").unwrap()),
            &[image.symbol("Sb").unwrap()],
        )
        .unwrap();
    assert_eq!(outcome, ValidationOutcome::Skipped);
    assert_eq!(builder.reader_writer().snapshot().segments().len(), 1);
}

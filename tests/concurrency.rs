mod common;

use common::{build, record_bytes, InProcess};
use genmeta::{
    builder::TypeLayout, memory::AllocationTag, BuilderConfig, GenericMetadataBuilder, Verbosity,
};
use pretty_assertions::assert_eq;
use std::{collections::HashSet, thread};

const THREADS: usize = 8;
const BUILDS_PER_THREAD: usize = 4;

#[test]
fn test_parallel_builds_share_allocator_and_lookup() {
    let fixture = InProcess::load();
    let int = fixture.address("Si");
    let bool = fixture.address("Sb");
    let descriptor = fixture.address("maybe_descriptor");

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let fixture = &fixture;
                scope.spawn(move || {
                    let mut builder = GenericMetadataBuilder::new(
                        fixture.reader_writer(BuilderConfig::new(Verbosity::Quiet)),
                    );
                    let argument = if i % 2 == 0 { int } else { bool };
                    (0..BUILDS_PER_THREAD)
                        .map(|_| {
                            let built = build(&mut builder, descriptor, &[argument]).unwrap();
                            let rw = builder.reader_writer();
                            (
                                i % 2,
                                built.record().address,
                                record_bytes(rw, &built),
                                TypeLayout::read_metadata(rw, built.record()).unwrap(),
                            )
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let addresses: HashSet<_> = results.iter().map(|(_, address, _, _)| *address).collect();
    assert_eq!(addresses.len(), THREADS * BUILDS_PER_THREAD);

    for parity in 0..2 {
        let mut same_argument = results.iter().filter(|(p, _, _, _)| *p == parity);
        let (_, _, bytes, layout) = same_argument.next().unwrap();
        for (_, _, other_bytes, other_layout) in same_argument {
            assert_eq!(other_bytes, bytes);
            assert_eq!(other_layout, layout);
        }
    }

    let records = fixture.allocator.stats(AllocationTag::GenericValueMetadata);
    assert_eq!(records.allocations, THREADS * BUILDS_PER_THREAD);
    let tables = fixture.allocator.stats(AllocationTag::ValueWitnessTable);
    assert_eq!(tables.allocations, THREADS * BUILDS_PER_THREAD);
}

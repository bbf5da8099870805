#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![warn(clippy::complexity)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
/*!
Cache file compiler for the Halo 1 engine family.

`blamforge` reads a directory tree of source tag files, resolves the
dependency graph hanging off a scenario tag, runs each tag's pre-compile
pass into the engine's in-memory layout, and assembles the single
monolithic cache file ("map") the engine memory-maps at runtime.

## Building a map

[`BuildWorkload::compile_map`] is the whole pipeline in one call: recursive
tag loading, per-class pre-compile, external-resource indexing, and image
assembly.

```rust,no_run
use blamforge::map::CacheFileEngine;
use blamforge::{BuildParameters, BuildWorkload, Result};

fn build() -> Result<()> {
    let image = BuildWorkload::compile_map(BuildParameters {
        scenario: String::from(r"levels\test\wizard\wizard"),
        tag_roots: vec!["tags".into()],
        engine: CacheFileEngine::CustomEdition,
        ..BuildParameters::default()
    })?;
    std::fs::write("wizard.map", image)?;
    Ok(())
}
```

Keeping the workload around after [`build`](`BuildWorkload::build`) gives
access to the resolved dependency set, accumulated warnings, and indexing
statistics:

```rust,no_run
use blamforge::{BuildParameters, BuildWorkload, Result};

fn inspect() -> Result<()> {
    let mut workload = BuildWorkload::new(BuildParameters {
        scenario: String::from(r"levels\test\wizard\wizard"),
        tag_roots: vec!["tags".into()],
        ..BuildParameters::default()
    });
    let image = workload.build()?;
    for dependency in workload.dependencies() {
        println!("{:?} {}", dependency.class, dependency.path);
    }
    for report in workload.reports() {
        eprintln!("warning: {}: {}", report.tag, report.message);
    }
    std::fs::write("wizard.map", image)?;
    Ok(())
}
```

## Compression

Finished images compress with the scheme their engine calls for: a whole
image zstd frame on the PC and native targets, a zlib stream on Xbox, and
the chunked parallel ceaflate container where streaming decompression is
needed.

```rust,no_run
use blamforge::compress::{compress_map, decompress_map};
use blamforge::Result;

fn shrink(image: &[u8]) -> Result<()> {
    let compressed = compress_map(image, 19)?;
    assert_eq!(decompress_map(&compressed)?, image);
    Ok(())
}
```
*/

pub mod build;
pub mod common;
pub mod compress;
pub mod map;
pub mod resource;
pub mod tag;
pub mod types;

#[doc(inline)]
pub use crate::common::errors::{Error, Result};
#[doc(inline)]
pub use crate::build::{BuildParameters, BuildWorkload};

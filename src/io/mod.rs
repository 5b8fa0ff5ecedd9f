//! ASCII persistence of the source grid and reconstructed map (spec.md §6),
//! gated behind the `io` cargo feature (mirrors the teacher's `vtk_extras`
//! feature split for its own mesh-format I/O).

pub mod ascii;

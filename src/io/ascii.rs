//! `<root>.info`/`.sb`/`.x`/`.y`/`.dat` dump/load (spec.md §6), grounded on
//! `original_source/pixelgrid.cpp`
//! `store_surface_brightness_grid_data`/`write_surface_brightness_to_file`/
//! `read_surface_brightness_data`: the recursive `-1e30` sentinel marks "this
//! cell is split; the next `Nu*Nw` values belong to its children, row-major",
//! with recursion continuing into any child that is itself split.

use crate::error::{GridError, ReconstructionError};
use crate::image_grid::ImageGrid;
use crate::numeric::Rect;
use crate::source_grid::{CellId, SourceGrid};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

const SPLIT_SENTINEL: f64 = -1e30;
/// Branching factor used when a sentinel is encountered while reading back a
/// dump (matches `mapping::refine`'s adaptive-split branching factor; the
/// first-level split is handled separately via `Nu0`/`Nw0` from `.info`).
const READ_SPLIT_NU: usize = 2;
const READ_SPLIT_NW: usize = 2;

/// Writes `<root>.info`: `Nu0 Nw0 levels` on the first line, domain bounds
/// `xmin xmax ymin ymax` on the second.
pub fn write_info(grid: &SourceGrid, root: &str) -> Result<(), ReconstructionError> {
    let mut f = std::fs::File::create(Path::new(root).with_extension("info"))?;
    writeln!(f, "{} {} {}", grid.nu0(), grid.nw0(), grid.levels())?;
    let d = grid.domain();
    writeln!(f, "{} {} {} {}", d.xmin, d.xmax, d.ymin, d.ymax)?;
    Ok(())
}

/// Reads `<root>.info`, returning `(nu0, nw0, levels, domain)`.
pub fn read_info(root: &str) -> Result<(usize, usize, usize, Rect), ReconstructionError> {
    let f = std::fs::File::open(Path::new(root).with_extension("info"))?;
    let mut lines = BufReader::new(f).lines();
    let header = lines
        .next()
        .ok_or_else(|| ReconstructionError::MalformedData("missing .info header line".into()))??;
    let mut parts = header.split_whitespace();
    let nu0 = parse_next::<usize>(&mut parts, "nu0")?;
    let nw0 = parse_next::<usize>(&mut parts, "nw0")?;
    let levels = parse_next::<usize>(&mut parts, "levels")?;

    let bounds_line = lines
        .next()
        .ok_or_else(|| ReconstructionError::MalformedData("missing .info bounds line".into()))??;
    let mut parts = bounds_line.split_whitespace();
    let xmin = parse_next::<f64>(&mut parts, "xmin")?;
    let xmax = parse_next::<f64>(&mut parts, "xmax")?;
    let ymin = parse_next::<f64>(&mut parts, "ymin")?;
    let ymax = parse_next::<f64>(&mut parts, "ymax")?;
    Ok((nu0, nw0, levels, Rect::new(xmin, xmax, ymin, ymax)))
}

fn parse_next<T: std::str::FromStr>(
    parts: &mut std::str::SplitWhitespace,
    field: &str,
) -> Result<T, ReconstructionError> {
    parts
        .next()
        .ok_or_else(|| ReconstructionError::MalformedData(format!("missing field {field}")))?
        .parse()
        .map_err(|_| ReconstructionError::MalformedData(format!("could not parse field {field}")))
}

/// Writes `<root>.sb`: pre-order (outer w, inner u) traversal of the source
/// tree's surface brightness, splitting leaves into the `-1e30` sentinel
/// followed by their children wherever the tree itself is split.
pub fn write_sb(grid: &SourceGrid, root: &str) -> Result<(), ReconstructionError> {
    let mut f = std::fs::File::create(Path::new(root).with_extension("sb"))?;
    for j in 0..grid.nw0() {
        for i in 0..grid.nu0() {
            write_cell(grid, grid.first_level_cell(i, j), &mut f)?;
        }
    }
    Ok(())
}

fn write_cell(grid: &SourceGrid, id: CellId, f: &mut impl Write) -> Result<(), ReconstructionError> {
    match grid.children_of(id) {
        None => writeln!(f, "{:.17e}", grid.cell(id).surface_brightness)?,
        Some(children) => {
            writeln!(f, "{SPLIT_SENTINEL}")?;
            for j in 0..children.nw {
                for i in 0..children.nu {
                    write_cell(grid, children.get(i, j), f)?;
                }
            }
        }
    }
    Ok(())
}

/// Reads `<root>.sb` into an already-constructed `grid` (first built fresh
/// from `<root>.info` via [`SourceGrid::new`] with matching `Nu0`/`Nw0`):
/// splits leaves on the `-1e30` sentinel exactly as
/// `read_surface_brightness_data` does.
pub fn read_sb(grid: &mut SourceGrid, root: &str) -> Result<(), ReconstructionError> {
    let f = std::fs::File::open(Path::new(root).with_extension("sb"))?;
    let mut lines = BufReader::new(f).lines();
    let (nu0, nw0) = (grid.nu0(), grid.nw0());
    for j in 0..nw0 {
        for i in 0..nu0 {
            let id = grid.first_level_cell(i, j);
            read_cell(grid, id, &mut lines)?;
        }
    }
    Ok(())
}

fn read_cell(
    grid: &mut SourceGrid,
    id: CellId,
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
) -> Result<(), ReconstructionError> {
    let line = lines
        .next()
        .ok_or_else(|| ReconstructionError::MalformedData("unexpected end of .sb file".into()))??;
    let value: f64 = line
        .trim()
        .parse()
        .map_err(|_| ReconstructionError::MalformedData(format!("could not parse .sb value {line:?}")))?;
    if value == SPLIT_SENTINEL {
        grid.split(id, READ_SPLIT_NU, READ_SPLIT_NW).map_err(GridError::from)?;
        let children = grid.children_of(id).expect("just split, must have children");
        for j in 0..children.nw {
            for i in 0..children.nu {
                read_cell(grid, children.get(i, j), lines)?;
            }
        }
    } else {
        grid.cell_mut(id).surface_brightness = value;
    }
    Ok(())
}

/// Writes `<root>.x`/`<root>.y`: pixel-center axis tick coordinates of the
/// image window's finest uniform sampling.
pub fn write_xy(image: &ImageGrid, root: &str) -> Result<(), ReconstructionError> {
    let window = image.window();
    let xstep = window.width() / image.nx() as f64;
    let ystep = window.height() / image.ny() as f64;

    let mut fx = std::fs::File::create(Path::new(root).with_extension("x"))?;
    for i in 0..image.nx() {
        writeln!(fx, "{:.17e}", window.xmin + (i as f64 + 0.5) * xstep)?;
    }

    let mut fy = std::fs::File::create(Path::new(root).with_extension("y"))?;
    for j in 0..image.ny() {
        writeln!(fy, "{:.17e}", window.ymin + (j as f64 + 0.5) * ystep)?;
    }
    Ok(())
}

/// Writes `<root>.dat`: a flat, row-major (`[j * nx + i]`) raster of
/// reconstructed surface brightness at the finest resolution.
pub fn write_dat(data: &[f64], nx: usize, ny: usize, root: &str) -> Result<(), ReconstructionError> {
    debug_assert_eq!(data.len(), nx * ny);
    let mut f = std::fs::File::create(Path::new(root).with_extension("dat"))?;
    for j in 0..ny {
        for i in 0..nx {
            write!(f, "{:.17e} ", data[j * nx + i])?;
        }
        writeln!(f)?;
    }
    Ok(())
}

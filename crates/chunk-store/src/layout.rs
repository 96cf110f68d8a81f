//! Chunk grid layout math shared by the storage drivers

use tensor_core::Region;

/// Number of chunks per dimension for an array extent
pub fn grid_counts(shape: &[usize], chunk_shape: &[usize]) -> Vec<usize> {
    shape
        .iter()
        .zip(chunk_shape)
        .map(|(&extent, &chunk)| extent.div_ceil(chunk))
        .collect()
}

/// Chunk-grid indices of every chunk overlapping a region
///
/// The region must be non-empty and in-bounds; a rank-0 array has exactly
/// one chunk with the empty index.
pub fn chunks_overlapping(region: &Region, chunk_shape: &[usize]) -> Vec<Vec<usize>> {
    let ranges: Vec<std::ops::Range<usize>> = (0..region.rank())
        .map(|d| {
            let lo = region.origin[d] / chunk_shape[d];
            let hi = (region.end(d) - 1) / chunk_shape[d] + 1;
            lo..hi
        })
        .collect();
    cartesian(&ranges)
}

/// The array region covered by a chunk index, clipped to the array bounds
pub fn chunk_region(index: &[usize], chunk_shape: &[usize], shape: &[usize]) -> Region {
    let origin: Vec<usize> = index
        .iter()
        .zip(chunk_shape)
        .map(|(&i, &c)| i * c)
        .collect();
    let extents: Vec<usize> = origin
        .iter()
        .zip(chunk_shape.iter().zip(shape))
        .map(|(&o, (&c, &s))| c.min(s - o))
        .collect();
    Region::new(origin, extents)
}

/// File name of a chunk, e.g. `c0.2` for index `[0, 2]`
pub fn chunk_file_name(prefix: char, index: &[usize]) -> String {
    if index.is_empty() {
        return format!("{}0", prefix);
    }
    let parts: Vec<String> = index.iter().map(|i| i.to_string()).collect();
    format!("{}{}", prefix, parts.join("."))
}

/// Row-major cartesian product of index ranges
pub fn cartesian(ranges: &[std::ops::Range<usize>]) -> Vec<Vec<usize>> {
    let mut out = vec![Vec::new()];
    for range in ranges {
        let mut next = Vec::with_capacity(out.len() * range.len());
        for prefix in &out {
            for i in range.clone() {
                let mut index = prefix.clone();
                index.push(i);
                next.push(index);
            }
        }
        out = next;
    }
    out
}

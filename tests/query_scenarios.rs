//! End-to-end read scenarios: estimation, Cartesian range semantics, and the
//! incomplete-result protocol.

use std::sync::Arc;

use celldex::{
    Array, ArraySchema, Attribute, AttributeData, CelldexError, Domain, Layout, Query, QueryStatus,
    Subarray, COORDS,
};

/// 4x4 sparse int32 array with values 1..=4 on the diagonal, row-major cell
/// order, one leaf tile, fanout 10.
fn diagonal_array() -> Arc<Array> {
    let domain = Domain::new(&[("rows", 0i32, 3), ("cols", 0i32, 3)]).unwrap();
    let schema = ArraySchema::sparse(domain)
        .with_attribute(Attribute::fixed("a", 4).unwrap())
        .with_fanout(10);
    let mut array = Array::create(schema).unwrap();
    array
        .write(
            &[0i32, 0, 1, 1, 2, 2, 3, 3],
            &[("a", AttributeData::fixed(&[1i32, 2, 3, 4]))],
        )
        .unwrap();
    Arc::new(array)
}

fn read_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[test]
fn test_single_cell_read() {
    let array = diagonal_array();
    let mut subarray = Subarray::new(array.clone(), Layout::Unordered);
    subarray.add_range(0, 0i32, 0).unwrap();
    subarray.add_range(1, 0i32, 0).unwrap();

    let mut query = Query::new(array);
    query.set_subarray(subarray).unwrap();
    assert_eq!(query.est_result_size("a").unwrap(), 1);

    query.set_layout(Layout::RowMajor).unwrap();
    query.set_buffer("a", 4).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    assert_eq!(query.result_buffer_elements()["a"], (0, 1));
    assert_eq!(read_i32s(query.buffer("a").unwrap()), vec![1]);
}

#[test]
fn test_single_range_read() {
    let array = diagonal_array();
    let mut subarray = Subarray::new(array.clone(), Layout::Unordered);
    subarray.add_range(0, 1i32, 2).unwrap();
    subarray.add_range(1, 1i32, 2).unwrap();

    let mut query = Query::new(array);
    query.set_subarray(subarray).unwrap();
    assert_eq!(query.est_result_size("a").unwrap(), 4);

    query.set_layout(Layout::RowMajor).unwrap();
    query.set_buffer("a", 16).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    assert_eq!(query.result_buffer_elements()["a"], (0, 2));
    assert_eq!(read_i32s(query.buffer("a").unwrap()), vec![2, 3]);
}

#[test]
fn test_two_point_ranges_per_dim() {
    let array = diagonal_array();
    let mut subarray = Subarray::new(array.clone(), Layout::Unordered);
    subarray.add_range(0, 0i32, 0).unwrap();
    subarray.add_range(1, 0i32, 0).unwrap();
    subarray.add_range(0, 2i32, 2).unwrap();
    subarray.add_range(1, 2i32, 2).unwrap();

    let mut query = Query::new(array);
    query.set_subarray(subarray).unwrap();
    assert_eq!(query.est_result_size("a").unwrap(), 4);

    query.set_buffer("a", 16).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    // Four ND sub-queries; only (0,0) and (2,2) hold cells.
    assert_eq!(query.result_buffer_elements()["a"], (0, 2));
    assert_eq!(read_i32s(query.buffer("a").unwrap()), vec![1, 3]);
}

#[test]
fn test_two_intervals_per_dim_cover_everything() {
    let array = diagonal_array();
    let mut subarray = Subarray::new(array.clone(), Layout::Unordered);
    subarray.add_range(0, 0i32, 1).unwrap();
    subarray.add_range(1, 0i32, 1).unwrap();
    subarray.add_range(0, 2i32, 3).unwrap();
    subarray.add_range(1, 2i32, 3).unwrap();

    let mut query = Query::new(array);
    query.set_subarray(subarray).unwrap();
    let est = query.est_result_size("a").unwrap();

    query.set_buffer("a", est).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    assert_eq!(query.result_buffer_elements()["a"], (0, 4));
    assert_eq!(read_i32s(query.buffer("a").unwrap()), vec![1, 2, 3, 4]);
}

#[test]
fn test_range_outside_domain_rejected_at_configuration() {
    let array = diagonal_array();
    let mut subarray = Subarray::new(array, Layout::Unordered);
    let err = subarray.add_range(0, 10i32, 20).unwrap_err();
    assert!(matches!(err, CelldexError::OutOfDomain(_)));
}

/// The sparse incomplete-read scenario: a 101 x 100001 col-major array with
/// 14 cells, read in global order through buffers holding two cells.
mod incomplete {
    use super::*;

    const CELLS: &[(i32, i32, u8)] = &[
        (0, 12277, b'a'),
        (0, 12771, b'b'),
        (0, 13374, b'c'),
        (0, 13395, b'd'),
        (0, 13413, b'e'),
        (0, 13451, b'f'),
        (0, 13519, b'g'),
        (0, 13544, b'h'),
        (0, 13689, b'i'),
        (0, 17479, b'j'),
        (0, 17486, b'k'),
        (1, 12277, b'l'),
        (1, 12771, b'm'),
        (1, 13389, b'n'),
    ];

    fn wide_array() -> Arc<Array> {
        let domain = Domain::new(&[("rows", 0i32, 100), ("cols", 0i32, 100_000)]).unwrap();
        let schema = ArraySchema::sparse(domain)
            .with_attribute(Attribute::fixed("a", 1).unwrap())
            .with_cell_order(Layout::ColMajor)
            .with_capacity(10_000);
        let mut array = Array::create(schema).unwrap();

        let mut coords = Vec::new();
        let mut values = Vec::new();
        for (row, col, value) in CELLS {
            coords.push(*row);
            coords.push(*col);
            values.push(*value);
        }
        array
            .write(&coords, &[("a", AttributeData::fixed(&values))])
            .unwrap();
        Arc::new(array)
    }

    fn wide_query(array: &Arc<Array>, data_capacity: u64, coords_capacity: u64) -> Query {
        let mut subarray = Subarray::new(array.clone(), Layout::Unordered);
        subarray.add_range(0, 0i32, 1).unwrap();
        subarray.add_range(1, 12277i32, 13499).unwrap();
        subarray.add_range(1, 13500i32, 17486).unwrap();

        let mut query = Query::new(array.clone());
        query.set_layout(Layout::GlobalOrder).unwrap();
        query.set_subarray(subarray).unwrap();
        query.set_buffer("a", data_capacity).unwrap();
        query.set_buffer(COORDS, coords_capacity).unwrap();
        query
    }

    #[test]
    fn test_incomplete_resume_batches() {
        let array = wide_array();
        // Buffers hold two cells: 2 value bytes, 2 coordinate pairs.
        let mut query = wide_query(&array, 2, 16);

        let expected: &[(&[u8], QueryStatus)] = &[
            (b"al", QueryStatus::Incomplete),
            (b"bm", QueryStatus::Incomplete),
            (b"c", QueryStatus::Incomplete),
            (b"nd", QueryStatus::Incomplete),
            (b"e", QueryStatus::Incomplete),
            (b"f", QueryStatus::Incomplete),
            (b"gh", QueryStatus::Incomplete),
            (b"i", QueryStatus::Incomplete),
            (b"jk", QueryStatus::Complete),
        ];
        for (batch, expected_status) in expected {
            let status = query.submit().unwrap();
            assert_eq!(status, *expected_status, "batch {:?}", batch);
            assert_eq!(query.buffer("a").unwrap(), *batch);
            let elements = query.result_buffer_elements();
            assert_eq!(elements[COORDS].1 / 2, batch.len() as u64);
            assert_eq!(elements["a"].1, batch.len() as u64);
        }
    }

    #[test]
    fn test_resumption_concatenation_matches_unbounded() {
        let array = wide_array();

        // One submit with effectively unbounded buffers.
        let mut reference = wide_query(&array, 1 << 20, 1 << 20);
        assert_eq!(reference.submit().unwrap(), QueryStatus::Complete);
        let all_values = reference.buffer("a").unwrap().to_vec();
        let all_coords = reference.buffer(COORDS).unwrap().to_vec();
        assert_eq!(all_values, b"albmcndefghijk");

        // The same stream through assorted buffer sizes.
        for cells_per_submit in [1u64, 2, 3, 5, 14] {
            let mut query = wide_query(&array, cells_per_submit, cells_per_submit * 8);
            let mut values = Vec::new();
            let mut coords = Vec::new();
            loop {
                let status = query.submit().unwrap();
                values.extend_from_slice(query.buffer("a").unwrap());
                coords.extend_from_slice(query.buffer(COORDS).unwrap());
                match status {
                    QueryStatus::Incomplete => continue,
                    QueryStatus::Complete => break,
                    other => panic!("unexpected status {:?}", other),
                }
            }
            assert_eq!(values, all_values, "{} cells per submit", cells_per_submit);
            assert_eq!(coords, all_coords, "{} cells per submit", cells_per_submit);
        }
    }
}

#[test]
fn test_overlapping_ranges_duplicate_results() {
    // Overlapping ranges on one dimension are preserved, so cells matched by
    // both ranges stream twice.
    let array = diagonal_array();
    let mut subarray = Subarray::new(array.clone(), Layout::Unordered);
    subarray.add_range(0, 1i32, 2).unwrap();
    subarray.add_range(0, 1i32, 2).unwrap();

    let mut query = Query::new(array);
    query.set_subarray(subarray).unwrap();
    query.set_buffer("a", 64).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    assert_eq!(read_i32s(query.buffer("a").unwrap()), vec![2, 3, 2, 3]);
}

#[test]
fn test_multi_tile_global_order_stream() {
    // Six cells, two per tile, fanout 2: a three-tile, height-2 tree.
    let domain = Domain::new(&[("x", 0i64, 1000)]).unwrap();
    let schema = ArraySchema::sparse(domain)
        .with_attribute(Attribute::fixed("v", 8).unwrap())
        .with_capacity(2)
        .with_fanout(2);
    let mut array = Array::create(schema).unwrap();
    let coords = [5i64, 100, 205, 310, 440, 512];
    array
        .write(
            &coords,
            &[("v", AttributeData::fixed(&[50i64, 1000, 2050, 3100, 4400, 5120]))],
        )
        .unwrap();
    let array = Arc::new(array);

    let mut subarray = Subarray::new(array.clone(), Layout::Unordered);
    subarray.add_range(0, 100i64, 450).unwrap();

    let mut query = Query::new(array);
    query.set_layout(Layout::GlobalOrder).unwrap();
    query.set_subarray(subarray).unwrap();
    query.set_buffer("v", 1 << 10).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);

    let values: Vec<i64> = query
        .buffer("v")
        .unwrap()
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(values, vec![1000, 2050, 3100, 4400]);
}

#[test]
fn test_row_major_result_order_across_ranges() {
    let array = diagonal_array();
    let mut subarray = Subarray::new(array.clone(), Layout::RowMajor);
    // Ranges added out of order on rows; each sub-range streams row-major.
    subarray.add_range(0, 2i32, 3).unwrap();
    subarray.add_range(0, 0i32, 1).unwrap();

    let mut query = Query::new(array);
    query.set_layout(Layout::RowMajor).unwrap();
    query.set_subarray(subarray).unwrap();
    query.set_buffer("a", 64).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    // First sub-range [2,3] then [0,1], in the order the caller added them.
    assert_eq!(read_i32s(query.buffer("a").unwrap()), vec![3, 4, 1, 2]);
}

#[test]
fn test_var_sized_attribute_stream() {
    let domain = Domain::new(&[("x", 0i32, 9)]).unwrap();
    let schema = ArraySchema::sparse(domain)
        .with_attribute(Attribute::var("s"))
        .with_capacity(4);
    let mut array = Array::create(schema).unwrap();
    array
        .write(
            &[0i32, 1, 2, 3],
            &[("s", AttributeData::var(&[b"ab".as_slice(), b"c", b"defg", b"hi"]))],
        )
        .unwrap();
    let array = Arc::new(array);

    let mut query = Query::new(array.clone());
    let (est_off, est_val) = query.est_result_size_var("s").unwrap();
    assert_eq!(est_off, 32);
    assert_eq!(est_val, 9);

    // Small value buffer: the stream splits.
    let mut query = Query::new(array);
    query.set_buffer_var("s", 64, 4).unwrap();
    let mut values = Vec::new();
    let mut cells = 0;
    loop {
        let status = query.submit().unwrap();
        values.extend_from_slice(query.var_buffer("s").unwrap());
        let (offsets, _) = query.result_buffer_elements()["s"];
        cells += offsets;
        match status {
            QueryStatus::Incomplete => continue,
            QueryStatus::Complete => break,
            other => panic!("unexpected status {:?}", other),
        }
    }
    assert_eq!(cells, 4);
    assert_eq!(values, b"abcdefghi");
}

#[test]
fn test_cancel_mid_stream() {
    let array = diagonal_array();
    let mut query = Query::new(array);
    query.set_buffer("a", 4).unwrap();

    assert_eq!(query.submit().unwrap(), QueryStatus::Incomplete);
    query.cancel();
    let err = query.submit().unwrap_err();
    assert_eq!(err, CelldexError::Cancelled);
    assert_eq!(query.status(), QueryStatus::Failed);
}

#[test]
fn test_clamped_range_reads_clamped_region() {
    let array = diagonal_array();
    let mut subarray = Subarray::new(array.clone(), Layout::Unordered);
    // Overhangs on both sides; clamps to [0,3].
    subarray.add_range(0, -5i32, 10).unwrap();
    subarray.add_range(1, 3i32, 7).unwrap();

    let mut query = Query::new(array);
    query.set_subarray(subarray).unwrap();
    query.set_buffer("a", 64).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    assert_eq!(read_i32s(query.buffer("a").unwrap()), vec![4]);
}

//! Ordered set difference over two sorted key tables.

use tracing::{debug, info};

use crate::keys::KeyTable;

/// Row counts produced by one key comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffCounts {
    pub only_source: usize,
    pub common: usize,
    pub only_target: usize,
}

/// Two-pointer merge of two sorted key tables. Rows present on exactly one
/// side get their flag raised on that side; common rows stay clear on both.
/// No extra allocation: the result lives in the tables' flag bits.
pub fn compare_keys(table: &str, source: &mut KeyTable, target: &mut KeyTable) -> DiffCounts {
    let mut i = 0;
    let mut j = 0;
    while i < source.len() && j < target.len() {
        if source.less(i, target, j) {
            source.set_flag(i, true);
            i += 1;
        } else if target.less(j, source, i) {
            target.set_flag(j, true);
            j += 1;
        } else {
            i += 1;
            j += 1;
        }
    }
    while i < source.len() {
        source.set_flag(i, true);
        i += 1;
    }
    while j < target.len() {
        target.set_flag(j, true);
        j += 1;
    }
    let only_source = source.size_of(true);
    let common = source.len() - only_source;
    let only_target = target.size_of(true);
    debug_assert_eq!(common, target.len() - only_target);
    debug!(
        "`{table}` records: source {} target {}",
        source.len(),
        target.len()
    );
    info!(
        "`{table}` primary key compare [only source: {only_source}] [common: {common}] [only target: {only_target}]"
    );
    DiffCounts {
        only_source,
        common,
        only_target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Scalar, SqlType};

    fn table(values: &[i32]) -> KeyTable {
        let mut t = KeyTable::new(false, 16);
        t.init_columns(vec![("key".to_string(), SqlType::Integer)]);
        for v in values {
            t.push_row(vec![Scalar::Int(*v)]);
        }
        t.sort("test");
        t
    }

    fn flagged(t: &KeyTable) -> Vec<usize> {
        t.iter(true).collect()
    }

    #[test]
    fn overlapping_sets_split_three_ways() {
        let mut src = table(&[1, 2, 3]);
        let mut dst = table(&[1, 4, 5]);
        let counts = compare_keys("t", &mut src, &mut dst);
        assert_eq!(
            counts,
            DiffCounts {
                only_source: 2,
                common: 1,
                only_target: 2
            }
        );
        assert_eq!(flagged(&src), vec![1, 2]);
        assert_eq!(flagged(&dst), vec![1, 2]);
    }

    #[test]
    fn identical_sets_are_all_common() {
        let mut src = table(&[1, 2, 3]);
        let mut dst = table(&[1, 2, 3]);
        let counts = compare_keys("t", &mut src, &mut dst);
        assert_eq!(counts.only_source, 0);
        assert_eq!(counts.common, 3);
        assert_eq!(counts.only_target, 0);
    }

    #[test]
    fn disjoint_sets_have_no_common_rows() {
        let mut src = table(&[1, 3, 5]);
        let mut dst = table(&[2, 4, 6]);
        let counts = compare_keys("t", &mut src, &mut dst);
        assert_eq!(counts.only_source, 3);
        assert_eq!(counts.common, 0);
        assert_eq!(counts.only_target, 3);
    }

    #[test]
    fn empty_sides_flag_everything_on_the_other() {
        let mut src = table(&[7, 8]);
        let mut dst = table(&[]);
        let counts = compare_keys("t", &mut src, &mut dst);
        assert_eq!(counts.only_source, 2);
        assert_eq!(counts.only_target, 0);

        let mut src = table(&[]);
        let mut dst = table(&[9]);
        let counts = compare_keys("t", &mut src, &mut dst);
        assert_eq!(counts.only_source, 0);
        assert_eq!(counts.only_target, 1);
        assert_eq!(counts.common, 0);
    }

    #[test]
    fn counts_partition_both_sides() {
        let mut src = table(&[1, 2, 4, 6, 9]);
        let mut dst = table(&[2, 3, 6, 7]);
        let counts = compare_keys("t", &mut src, &mut dst);
        assert_eq!(counts.only_source + counts.common, src.len());
        assert_eq!(counts.only_target + counts.common, dst.len());
    }
}

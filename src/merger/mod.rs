use std::{cmp::Ordering, fmt};

use crate::encoding::{BlobReader, BlobWriter, Decode, Encode};

/// The policy an index uses to order, coalesce and combine the items of an
/// itemset. All sequence arguments must already be sorted under `is_lt`.
pub trait Merger<K, I> {
    /// Sorts `items` and coalesces equal entries. A local merge runs on a
    /// partial view of the itemset, so it must keep anything that a later
    /// global merge could still cancel out.
    fn merge(&self, items: &mut Vec<I>, is_local: bool);
    fn union(&self, main: &[I], join: &[I]) -> Vec<I>;
    fn intersect(&self, main: &[I], join: &[I]) -> Vec<I>;
    /// Items of `main` that have no equal entry in `join`.
    fn minus(&self, main: &[I], join: &[I]) -> Vec<I>;
    /// Removes every entry equal to `item`.
    fn delete(&self, item: &I, items: &mut Vec<I>);
    fn is_lt(&self, a: &I, b: &I) -> bool;

    fn is_lte(&self, a: &I, b: &I) -> bool {
        !self.is_lt(b, a)
    }

    /// Post-processes the items of a key before they take part in an
    /// expression.
    fn def(&self, _key: &K, _items: &mut Vec<I>) {}
}

fn is_sorted<I: Ord>(items: &[I]) -> bool {
    items.windows(2).all(|w| w[0] <= w[1])
}

fn sorted_merge<I, F>(main: &[I], join: &[I], mut on_both: F, keep_unmatched: bool) -> Vec<I>
where
    I: Ord + Clone,
    F: FnMut(&I, &I) -> Option<I>,
{
    debug_assert!(is_sorted(main) && is_sorted(join));
    let mut result = Vec::with_capacity(if keep_unmatched {
        main.len() + join.len()
    } else {
        main.len().min(join.len())
    });
    let (mut i, mut j) = (0, 0);
    while i < main.len() && j < join.len() {
        match main[i].cmp(&join[j]) {
            Ordering::Less => {
                if keep_unmatched {
                    result.push(main[i].clone());
                }
                i += 1;
            }
            Ordering::Greater => {
                if keep_unmatched {
                    result.push(join[j].clone());
                }
                j += 1;
            }
            Ordering::Equal => {
                result.extend(on_both(&main[i], &join[j]));
                i += 1;
                j += 1;
            }
        }
    }
    if keep_unmatched {
        result.extend_from_slice(&main[i..]);
        result.extend_from_slice(&join[j..]);
    }
    result
}

fn minus_sorted<I: Ord + Clone>(main: &[I], join: &[I]) -> Vec<I> {
    debug_assert!(is_sorted(main) && is_sorted(join));
    let mut result = Vec::with_capacity(main.len());
    let mut j = 0;
    for item in main {
        while j < join.len() && join[j] < *item {
            j += 1;
        }
        if j >= join.len() || join[j] != *item {
            result.push(item.clone());
        }
    }
    result
}

/// Plain set semantics: items are their own identity and duplicates collapse.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetMerger;

impl<K, I: Ord + Clone> Merger<K, I> for SetMerger {
    fn merge(&self, items: &mut Vec<I>, _is_local: bool) {
        items.sort();
        items.dedup();
    }

    fn union(&self, main: &[I], join: &[I]) -> Vec<I> {
        sorted_merge(main, join, |a, _| Some(a.clone()), true)
    }

    fn intersect(&self, main: &[I], join: &[I]) -> Vec<I> {
        sorted_merge(main, join, |a, _| Some(a.clone()), false)
    }

    fn minus(&self, main: &[I], join: &[I]) -> Vec<I> {
        minus_sorted(main, join)
    }

    fn delete(&self, item: &I, items: &mut Vec<I>) {
        items.retain(|x| x != item);
    }

    fn is_lt(&self, a: &I, b: &I) -> bool {
        a < b
    }
}

/// An item of a counting index: a document id and how often the key occurs
/// in it. Postings are identified and ordered by `id` alone.
#[derive(Debug, Clone, Copy)]
pub struct Posting {
    pub id: u64,
    pub count: i32,
}

impl Posting {
    pub fn new(id: u64, count: i32) -> Self {
        Posting { id, count }
    }
}

impl PartialEq for Posting {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Posting {}

impl PartialOrd for Posting {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Posting {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Posting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.count)
    }
}

impl Encode for Posting {
    fn write_bytes(&self, w: &mut BlobWriter) {
        self.id.write_bytes(w);
        self.count.write_bytes(w);
    }
}

impl Decode for Posting {
    fn decode(r: &mut BlobReader) -> anyhow::Result<Self> {
        Ok(Posting {
            id: u64::decode(r)?,
            count: i32::decode(r)?,
        })
    }
}

/// Sums the counts of equal postings. A global merge drops postings whose
/// count fell to zero or below; a local merge keeps negative counts since
/// they may cancel against entries outside its view.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountMerger;

impl<K> Merger<K, Posting> for CountMerger {
    fn merge(&self, items: &mut Vec<Posting>, is_local: bool) {
        if items.is_empty() {
            return;
        }
        if !is_sorted(items) {
            items.sort();
        }
        let mut out = 0;
        for i in 0..items.len() {
            if out > 0 && items[out - 1].id == items[i].id {
                items[out - 1].count += items[i].count;
            } else {
                items[out] = items[i];
                out += 1;
            }
        }
        items.truncate(out);
        items.retain(|p| {
            if p.count > 0 {
                return true;
            }
            if p.count < 0 {
                if is_local {
                    return true;
                }
                tracing::warn!(id = p.id, count = p.count, "dropping negative posting count");
            }
            false
        });
    }

    fn union(&self, main: &[Posting], join: &[Posting]) -> Vec<Posting> {
        sorted_merge(
            main,
            join,
            |a, b| Some(Posting::new(a.id, a.count + b.count)),
            true,
        )
    }

    fn intersect(&self, main: &[Posting], join: &[Posting]) -> Vec<Posting> {
        sorted_merge(
            main,
            join,
            |a, b| Some(Posting::new(a.id, a.count + b.count)),
            false,
        )
    }

    fn minus(&self, main: &[Posting], join: &[Posting]) -> Vec<Posting> {
        minus_sorted(main, join)
    }

    fn delete(&self, item: &Posting, items: &mut Vec<Posting>) {
        items.retain(|p| p.id != item.id);
    }

    fn is_lt(&self, a: &Posting, b: &Posting) -> bool {
        a.id < b.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postings(v: &[(u64, i32)]) -> Vec<Posting> {
        v.iter().map(|(id, count)| Posting::new(*id, *count)).collect()
    }

    fn pairs(v: &[Posting]) -> Vec<(u64, i32)> {
        v.iter().map(|p| (p.id, p.count)).collect()
    }

    fn merged(v: &[(u64, i32)], is_local: bool) -> Vec<(u64, i32)> {
        let mut items = postings(v);
        Merger::<(), Posting>::merge(&CountMerger, &mut items, is_local);
        pairs(&items)
    }

    #[test]
    fn test_count_merge() {
        assert_eq!(
            merged(&[(3, 1), (1, 2), (3, 4), (2, 1), (1, 1)], false),
            vec![(1, 3), (2, 1), (3, 5)]
        );
        assert_eq!(merged(&[(5, 1), (5, -1), (6, 1)], false), vec![(6, 1)]);
        assert_eq!(merged(&[(5, -2), (6, 1)], true), vec![(5, -2), (6, 1)]);
        assert_eq!(merged(&[(5, -2), (6, 1)], false), vec![(6, 1)]);
        assert_eq!(merged(&[(5, 0)], true), Vec::<(u64, i32)>::new());
        assert_eq!(merged(&[], false), Vec::<(u64, i32)>::new());
    }

    #[test]
    fn test_count_set_ops() {
        let m = CountMerger;
        let a = postings(&[(1, 1), (3, 2), (5, 1)]);
        let b = postings(&[(3, 1), (4, 1), (5, 5)]);
        assert_eq!(
            pairs(&Merger::<(), Posting>::union(&m, &a, &b)),
            vec![(1, 1), (3, 3), (4, 1), (5, 6)]
        );
        assert_eq!(
            pairs(&Merger::<(), Posting>::intersect(&m, &a, &b)),
            vec![(3, 3), (5, 6)]
        );
        assert_eq!(pairs(&Merger::<(), Posting>::minus(&m, &a, &b)), vec![(1, 1)]);
        assert_eq!(
            pairs(&Merger::<(), Posting>::minus(&m, &b, &a)),
            vec![(4, 1)]
        );

        let mut c = postings(&[(1, 1), (3, 2), (3, 7), (4, 1)]);
        Merger::<(), Posting>::delete(&m, &Posting::new(3, 0), &mut c);
        assert_eq!(pairs(&c), vec![(1, 1), (4, 1)]);
    }

    #[test]
    fn test_set_merger() {
        let m = SetMerger;
        let mut items = vec![5, 1, 5, 3, 1];
        Merger::<(), u32>::merge(&m, &mut items, true);
        assert_eq!(items, vec![1, 3, 5]);
        assert_eq!(Merger::<(), u32>::union(&m, &[1, 3], &[2, 3]), vec![1, 2, 3]);
        assert_eq!(Merger::<(), u32>::intersect(&m, &[1, 3], &[2, 3]), vec![3]);
        assert_eq!(Merger::<(), u32>::minus(&m, &[1, 3], &[2, 3]), vec![1]);
        assert!(Merger::<(), u32>::is_lte(&m, &3, &3));
        assert!(!Merger::<(), u32>::is_lt(&m, &3, &3));
    }
}

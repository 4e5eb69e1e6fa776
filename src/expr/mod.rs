use std::collections::VecDeque;

use crate::{
    fs::DbDir,
    gix::{Gix, GixItem, GixKey},
    merger::Merger,
};

/// A boolean query over the keys of an index.
///
/// `Not` is never materialized against a universe of items; evaluation
/// instead carries a complement flag that the enclosing `And`/`Or` resolves
/// into a set difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GixExpr<K> {
    Empty,
    Key(K),
    And(Box<GixExpr<K>>, Box<GixExpr<K>>),
    Or(Box<GixExpr<K>>, Box<GixExpr<K>>),
    Not(Box<GixExpr<K>>),
}

#[derive(Clone, Copy)]
enum Op {
    And,
    Or,
}

enum Slot {
    // Index into the input expressions.
    Leaf(usize),
    Pair(usize, usize),
}

impl<K> GixExpr<K> {
    pub fn key(key: K) -> Self {
        GixExpr::Key(key)
    }

    pub fn and(left: GixExpr<K>, right: GixExpr<K>) -> Self {
        GixExpr::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: GixExpr<K>, right: GixExpr<K>) -> Self {
        GixExpr::Or(Box::new(left), Box::new(right))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: GixExpr<K>) -> Self {
        GixExpr::Not(Box::new(expr))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, GixExpr::Empty)
    }

    pub fn and_of(exprs: Vec<GixExpr<K>>) -> Self {
        Self::balanced(exprs, Op::And)
    }

    pub fn or_of(exprs: Vec<GixExpr<K>>) -> Self {
        Self::balanced(exprs, Op::Or)
    }

    pub fn and_of_keys<T: IntoIterator<Item = K>>(keys: T) -> Self {
        Self::and_of(keys.into_iter().map(GixExpr::Key).collect())
    }

    pub fn or_of_keys<T: IntoIterator<Item = K>>(keys: T) -> Self {
        Self::or_of(keys.into_iter().map(GixExpr::Key).collect())
    }

    // Each new operand splits the oldest leaf still waiting in the queue into
    // a pair of itself and the operand, which keeps the depth logarithmic.
    fn balanced(exprs: Vec<GixExpr<K>>, op: Op) -> Self {
        if exprs.is_empty() {
            return GixExpr::Empty;
        }

        let mut slots = vec![Slot::Leaf(0)];
        let mut queue = VecDeque::from([0]);
        for i in 1..exprs.len() {
            let Some(s) = queue.pop_front() else {
                unreachable!("queue always holds at least one leaf");
            };
            let left = slots.len();
            let right = left + 1;
            let Slot::Leaf(old) = slots[s] else {
                unreachable!("only leaves are queued");
            };
            slots.push(Slot::Leaf(old));
            slots.push(Slot::Leaf(i));
            slots[s] = Slot::Pair(left, right);
            queue.push_back(left);
            queue.push_back(right);
        }

        // Children always come after their parent, so assemble back to front.
        let mut inputs: Vec<Option<GixExpr<K>>> = exprs.into_iter().map(Some).collect();
        let mut built: Vec<Option<GixExpr<K>>> = (0..slots.len()).map(|_| None).collect();
        for s in (0..slots.len()).rev() {
            let expr = match slots[s] {
                Slot::Leaf(i) => inputs[i].take(),
                Slot::Pair(l, r) => match (built[l].take(), built[r].take()) {
                    (Some(l), Some(r)) => Some(match op {
                        Op::And => GixExpr::and(l, r),
                        Op::Or => GixExpr::or(l, r),
                    }),
                    _ => unreachable!("children are built before their parent"),
                },
            };
            built[s] = expr;
        }
        built[0].take().unwrap_or(GixExpr::Empty)
    }

    /// Number of nodes on the longest path from the root to a leaf.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 1)];
        while let Some((expr, d)) = stack.pop() {
            deepest = deepest.max(d);
            match expr {
                GixExpr::Empty | GixExpr::Key(_) => {}
                GixExpr::Not(e) => stack.push((e, d + 1)),
                GixExpr::And(l, r) | GixExpr::Or(l, r) => {
                    stack.push((l, d + 1));
                    stack.push((r, d + 1));
                }
            }
        }
        deepest
    }
}

impl<K: GixKey> GixExpr<K> {
    /// Evaluates against `gix`, combining itemsets with `merger`. Returns the
    /// items and whether they stand for their complement, i.e. the result is
    /// every item except the returned ones.
    pub fn eval<D, I, M, E>(&self, gix: &mut Gix<D, K, I, M>, merger: &E) -> anyhow::Result<(Vec<I>, bool)>
    where
        D: DbDir,
        I: GixItem,
        M: Merger<K, I>,
        E: Merger<K, I>,
    {
        match self {
            GixExpr::Empty => Ok((Vec::new(), false)),
            GixExpr::Key(key) => {
                if !gix.is_key(key) {
                    return Ok((Vec::new(), false));
                }
                let mut items = gix.item_vec(key)?;
                merger.def(key, &mut items);
                Ok((items, false))
            }
            GixExpr::Not(e) => {
                let (items, not) = e.eval(gix, merger)?;
                Ok((items, !not))
            }
            GixExpr::And(l, r) => {
                let (left, not_left) = l.eval(gix, merger)?;
                let (right, not_right) = r.eval(gix, merger)?;
                Ok(match (not_left, not_right) {
                    (true, true) => (merger.union(&left, &right), true),
                    (false, false) => (merger.intersect(&left, &right), false),
                    (true, false) => (merger.minus(&right, &left), false),
                    (false, true) => (merger.minus(&left, &right), false),
                })
            }
            GixExpr::Or(l, r) => {
                let (left, not_left) = l.eval(gix, merger)?;
                let (right, not_right) = r.eval(gix, merger)?;
                Ok(match (not_left, not_right) {
                    (true, true) => (merger.intersect(&left, &right), true),
                    (false, false) => (merger.union(&left, &right), false),
                    (true, false) => (merger.minus(&left, &right), true),
                    (false, true) => (merger.minus(&right, &left), true),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::{Access, GixConfig},
        fs::MockDir,
        merger::{CountMerger, Posting, SetMerger},
    };

    use super::*;

    fn leaves(expr: &GixExpr<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        let mut stack = vec![expr];
        while let Some(e) = stack.pop() {
            match e {
                GixExpr::Key(k) => out.push(*k),
                GixExpr::Empty => {}
                GixExpr::Not(e) => stack.push(e),
                GixExpr::And(l, r) | GixExpr::Or(l, r) => {
                    stack.push(r);
                    stack.push(l);
                }
            }
        }
        out
    }

    #[test]
    fn test_balanced_builders() {
        assert!(GixExpr::<u32>::and_of_keys(vec![]).is_empty());
        assert_eq!(GixExpr::or_of_keys(vec![7]), GixExpr::Key(7));

        let e = GixExpr::and_of_keys(vec![1, 2, 3, 4]);
        assert_eq!(
            e,
            GixExpr::and(
                GixExpr::and(GixExpr::key(1), GixExpr::key(3)),
                GixExpr::and(GixExpr::key(2), GixExpr::key(4)),
            )
        );

        let keys: Vec<u32> = (0..1000).collect();
        let e = GixExpr::or_of_keys(keys.clone());
        let mut got = leaves(&e);
        got.sort_unstable();
        assert_eq!(got, keys);
        // 1000 leaves fit in a tree of 10 levels below the root.
        assert_eq!(e.depth(), 11);

        let e = GixExpr::and_of_keys(0..100_000u32);
        assert_eq!(e.depth(), 18);
    }

    fn index() -> Gix<MockDir, String, Posting, CountMerger> {
        let config = GixConfig::new(Access::Create).with_split(8, 4, 16);
        let mut gix = Gix::open(MockDir::new(), config, CountMerger).unwrap();
        for (key, ids) in [
            ("a", vec![1, 2, 3, 4, 5]),
            ("b", vec![4, 5, 6, 7]),
            ("c", vec![5, 9]),
        ] {
            for id in ids {
                gix.add_item(key.to_owned(), Posting::new(id, 1)).unwrap();
            }
        }
        gix
    }

    fn ids(result: (Vec<Posting>, bool)) -> (Vec<u64>, bool) {
        (result.0.into_iter().map(|p| p.id).collect(), result.1)
    }

    fn k(s: &str) -> GixExpr<String> {
        GixExpr::key(s.to_owned())
    }

    #[test]
    fn test_eval() -> anyhow::Result<()> {
        let mut gix = index();
        let m = CountMerger;

        assert_eq!(ids(k("a").eval(&mut gix, &m)?), (vec![1, 2, 3, 4, 5], false));
        assert_eq!(ids(k("missing").eval(&mut gix, &m)?), (vec![], false));
        assert_eq!(ids(GixExpr::Empty.eval(&mut gix, &m)?), (vec![], false));

        let e = GixExpr::and(k("a"), k("b"));
        let (items, not) = e.eval(&mut gix, &m)?;
        assert!(!not);
        assert_eq!(
            items.iter().map(|p| (p.id, p.count)).collect::<Vec<_>>(),
            vec![(4, 2), (5, 2)]
        );

        assert_eq!(
            ids(GixExpr::or(k("b"), k("c")).eval(&mut gix, &m)?),
            (vec![4, 5, 6, 7, 9], false)
        );
        assert_eq!(
            ids(GixExpr::not(k("c")).eval(&mut gix, &m)?),
            (vec![5, 9], true)
        );

        // a AND NOT b, in both operand orders.
        assert_eq!(
            ids(GixExpr::and(k("a"), GixExpr::not(k("b"))).eval(&mut gix, &m)?),
            (vec![1, 2, 3], false)
        );
        assert_eq!(
            ids(GixExpr::and(GixExpr::not(k("b")), k("a")).eval(&mut gix, &m)?),
            (vec![1, 2, 3], false)
        );

        // NOT a AND NOT c = NOT (a OR c)
        assert_eq!(
            ids(GixExpr::and(GixExpr::not(k("a")), GixExpr::not(k("c"))).eval(&mut gix, &m)?),
            (vec![1, 2, 3, 4, 5, 9], true)
        );

        // NOT a OR NOT b = NOT (a AND b)
        assert_eq!(
            ids(GixExpr::or(GixExpr::not(k("a")), GixExpr::not(k("b"))).eval(&mut gix, &m)?),
            (vec![4, 5], true)
        );

        // b OR NOT a = NOT (a minus b), in both operand orders.
        assert_eq!(
            ids(GixExpr::or(k("b"), GixExpr::not(k("a"))).eval(&mut gix, &m)?),
            (vec![1, 2, 3], true)
        );
        assert_eq!(
            ids(GixExpr::or(GixExpr::not(k("a")), k("b")).eval(&mut gix, &m)?),
            (vec![1, 2, 3], true)
        );

        assert_eq!(
            ids(GixExpr::and_of_keys(["a", "b", "c"].map(String::from)).eval(&mut gix, &m)?),
            (vec![5], false)
        );
        assert_eq!(
            ids(GixExpr::or_of_keys(["a", "b", "c"].map(String::from)).eval(&mut gix, &m)?),
            (vec![1, 2, 3, 4, 5, 6, 7, 9], false)
        );
        Ok(())
    }

    struct EvenOnly;

    impl Merger<String, u64> for EvenOnly {
        fn merge(&self, items: &mut Vec<u64>, is_local: bool) {
            Merger::<String, u64>::merge(&SetMerger, items, is_local)
        }
        fn union(&self, main: &[u64], join: &[u64]) -> Vec<u64> {
            Merger::<String, u64>::union(&SetMerger, main, join)
        }
        fn intersect(&self, main: &[u64], join: &[u64]) -> Vec<u64> {
            Merger::<String, u64>::intersect(&SetMerger, main, join)
        }
        fn minus(&self, main: &[u64], join: &[u64]) -> Vec<u64> {
            Merger::<String, u64>::minus(&SetMerger, main, join)
        }
        fn delete(&self, item: &u64, items: &mut Vec<u64>) {
            Merger::<String, u64>::delete(&SetMerger, item, items)
        }
        fn is_lt(&self, a: &u64, b: &u64) -> bool {
            a < b
        }
        fn def(&self, _key: &String, items: &mut Vec<u64>) {
            items.retain(|x| x % 2 == 0);
        }
    }

    #[test]
    fn test_eval_applies_def() -> anyhow::Result<()> {
        let config = GixConfig::new(Access::Create);
        let mut gix: Gix<_, String, u64, SetMerger> =
            Gix::open(MockDir::new(), config, SetMerger)?;
        gix.add_item_vec("x".to_owned(), (0..10).collect())?;
        gix.add_item_vec("y".to_owned(), (5..15).collect())?;

        let e = GixExpr::and(GixExpr::key("x".to_owned()), GixExpr::key("y".to_owned()));
        assert_eq!(e.eval(&mut gix, &SetMerger)?, (vec![5, 6, 7, 8, 9], false));
        assert_eq!(e.eval(&mut gix, &EvenOnly)?, (vec![6, 8], false));
        Ok(())
    }
}

use std::time::Duration;

use rand::Rng;

use crate::{
    config::{Access, GixConfig},
    fs::MockDir,
    merger::{CountMerger, Posting},
};

use super::Gix;

#[derive(Debug, Clone)]
enum Op {
    Add(String, u64),
    AddVec(String, Vec<u64>),
    Delete(String, u64),
    Clear(String),
    DeleteItemSet(String),
    Get(String),
    Consolidate(String),
    Flush,
    PartialFlush,
    Refresh,
    Reload,
}

#[derive(Debug, Copy, Clone)]
enum Reduction {
    DeleteLogicalOp(usize),
    DeletePhysicalOp(usize),
}

#[derive(Debug, Clone)]
struct TestCase {
    logical_ops: Vec<Op>,
    physical_ops: Vec<(usize, Op)>,
    logical_idx: usize,
    physical_idx: usize,
}

impl TestCase {
    fn new(logical_ops: Vec<Op>, physical_ops: Vec<(usize, Op)>) -> Self {
        TestCase {
            logical_ops,
            physical_ops,
            logical_idx: 0,
            physical_idx: 0,
        }
    }

    fn add_physical_op(&mut self, idx: usize, op: Op) {
        self.physical_ops.push((idx, op));
    }

    fn sort(&mut self) {
        self.physical_ops.sort_by_key(|(idx, _)| *idx);
    }

    fn logical_len(&self) -> usize {
        self.logical_ops.len()
    }

    fn physical_len(&self) -> usize {
        self.physical_ops.len()
    }

    fn apply_reduction(&mut self, reduction: Reduction) {
        match reduction {
            Reduction::DeletePhysicalOp(idx) => {
                self.physical_ops.remove(idx);
            }
            Reduction::DeleteLogicalOp(idx) => {
                self.logical_ops.remove(idx);
                for op in self.physical_ops.iter_mut() {
                    if op.0 > idx {
                        op.0 -= 1;
                    }
                }
            }
        }
    }
}

impl Iterator for TestCase {
    type Item = Op;

    fn next(&mut self) -> Option<Self::Item> {
        if self.physical_idx < self.physical_ops.len()
            && self.physical_ops[self.physical_idx].0 <= self.logical_idx
        {
            self.physical_idx += 1;
            Some(self.physical_ops[self.physical_idx - 1].1.clone())
        } else if self.logical_idx < self.logical_ops.len() {
            self.logical_idx += 1;
            Some(self.logical_ops[self.logical_idx - 1].clone())
        } else {
            None
        }
    }
}

fn open(dir: &MockDir, access: Access) -> Gix<MockDir, String, Posting, CountMerger> {
    // Small splits and a tiny cache so that children, evictions and
    // relocations all happen within a short run.
    let config = GixConfig::new(access)
        .with_split(16, 8, 32)
        .with_cache_size(6_000);
    Gix::open(dir.clone(), config, CountMerger).unwrap()
}

fn run_sequence(inputs: TestCase) -> Vec<Vec<(u64, i32)>> {
    let dir = MockDir::new();
    let mut gix = open(&dir, Access::Create);

    let mut out = Vec::new();

    for input in inputs {
        match input {
            Op::Add(k, id) => gix.add_item(k, Posting::new(id, 1)).unwrap(),
            Op::AddVec(k, ids) => gix
                .add_item_vec(k, ids.into_iter().map(|id| Posting::new(id, 1)).collect())
                .unwrap(),
            Op::Delete(k, id) => gix.del_item(&k, Posting::new(id, 1)).unwrap(),
            Op::Clear(k) => gix.clear(&k).unwrap(),
            Op::DeleteItemSet(k) => gix.delete_item_set(&k).unwrap(),
            Op::Get(k) => out.push(
                gix.item_vec(&k)
                    .unwrap()
                    .into_iter()
                    .map(|p| (p.id, p.count))
                    .collect(),
            ),
            Op::Consolidate(k) => gix.item_set(&k).unwrap().consolidate().unwrap(),
            Op::Flush => gix.flush().unwrap(),
            Op::PartialFlush => {
                gix.partial_flush(Duration::from_secs(60)).unwrap();
            }
            Op::Refresh => gix.refresh_mem_used().unwrap(),
            Op::Reload => {
                gix.close().unwrap();
                gix = open(&dir, Access::Update);
            }
        }
    }

    out
}

#[test]
fn metamorphic_test() {
    let mut rng = rand::thread_rng();
    let key = |rng: &mut rand::rngs::ThreadRng| format!("key{}", rng.gen_range(0..6));
    let inputs = (0..150)
        .map(|_| match rng.gen_range(0..10) {
            0..=2 => Op::Add(key(&mut rng), rng.gen_range(0..200)),
            3..=4 => {
                let start = rng.gen_range(0..200);
                let len = rng.gen_range(1..40);
                let mut ids: Vec<u64> = (start..start + len).collect();
                if rng.gen_bool(0.5) {
                    ids.reverse();
                }
                Op::AddVec(key(&mut rng), ids)
            }
            5..=6 => Op::Delete(key(&mut rng), rng.gen_range(0..200)),
            7 => {
                if rng.gen_bool(0.5) {
                    Op::Clear(key(&mut rng))
                } else {
                    Op::DeleteItemSet(key(&mut rng))
                }
            }
            _ => Op::Get(key(&mut rng)),
        })
        .collect::<Vec<_>>();

    let mut inputs = TestCase::new(inputs, Vec::new());

    let mut new_inputs = inputs.clone();

    let expected_output = run_sequence(inputs.clone());

    for _ in 0..60 {
        let idx = rng.gen_range(0..new_inputs.logical_len());
        match rng.gen_range(0..5) {
            0 => new_inputs.add_physical_op(idx, Op::Flush),
            1 => new_inputs.add_physical_op(idx, Op::PartialFlush),
            2 => new_inputs.add_physical_op(idx, Op::Refresh),
            3 => new_inputs.add_physical_op(idx, Op::Reload),
            4 => new_inputs.add_physical_op(idx, Op::Consolidate(key(&mut rng))),
            _ => unreachable!(),
        }
    }

    new_inputs.sort();

    let new_output = run_sequence(new_inputs.clone());

    if new_output != expected_output {
        let reduced_case = loop {
            let mut better_case = None;

            for idx in 0..inputs.logical_len() {
                let mut inputs_reduced = inputs.clone();
                let mut new_inputs_reduced = new_inputs.clone();
                inputs_reduced.apply_reduction(Reduction::DeleteLogicalOp(idx));
                new_inputs_reduced.apply_reduction(Reduction::DeleteLogicalOp(idx));

                let a_output = run_sequence(inputs_reduced.clone());
                let b_output = run_sequence(new_inputs_reduced.clone());

                if a_output != b_output {
                    better_case = Some((inputs_reduced, new_inputs_reduced));
                    break;
                }
            }
            if let Some((a, b)) = better_case {
                inputs = a;
                new_inputs = b;
                continue;
            }

            for idx in 0..new_inputs.physical_len() {
                let mut new_inputs_reduced = new_inputs.clone();
                new_inputs_reduced.apply_reduction(Reduction::DeletePhysicalOp(idx));

                let a_output = run_sequence(inputs.clone());
                let b_output = run_sequence(new_inputs_reduced.clone());

                if a_output != b_output {
                    better_case = Some((inputs.clone(), new_inputs_reduced));
                    break;
                }
            }
            if let Some((a, b)) = better_case {
                inputs = a;
                new_inputs = b;
                continue;
            }

            break (inputs, new_inputs);
        };

        println!("reduced case: {:#?}", reduced_case);
        panic!("they differed!")
    }
}

/// Every get must also agree with a plain in-memory model of the index.
#[test]
fn model_test() {
    use std::collections::BTreeMap;

    let mut rng = rand::thread_rng();
    let dir = MockDir::new();
    let mut gix = open(&dir, Access::Create);
    let mut model: BTreeMap<String, BTreeMap<u64, i32>> = BTreeMap::new();

    for step in 0..400 {
        let k = format!("key{}", rng.gen_range(0..4));
        match rng.gen_range(0..10) {
            0..=4 => {
                let id = rng.gen_range(0..300);
                gix.add_item(k.clone(), Posting::new(id, 1)).unwrap();
                *model.entry(k).or_default().entry(id).or_default() += 1;
            }
            5..=6 => {
                let id = rng.gen_range(0..300);
                gix.del_item(&k, Posting::new(id, 1)).unwrap();
                if let Some(m) = model.get_mut(&k) {
                    m.remove(&id);
                }
            }
            7 => {
                gix.clear(&k).unwrap();
                model.remove(&k);
            }
            _ => {
                let got: Vec<(u64, i32)> = gix
                    .item_vec(&k)
                    .unwrap()
                    .into_iter()
                    .map(|p| (p.id, p.count))
                    .collect();
                let want: Vec<(u64, i32)> = model
                    .get(&k)
                    .map(|m| m.iter().map(|(id, c)| (*id, *c)).collect())
                    .unwrap_or_default();
                assert_eq!(got, want, "step {} key {}", step, k);
            }
        }
        if step % 97 == 96 {
            gix.close().unwrap();
            gix = open(&dir, Access::Update);
        }
    }
}

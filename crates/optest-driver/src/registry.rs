use std::collections::HashMap;

use optest_core::OpKernel;

use crate::ops::{AbsOp, AddOp};

pub type OpFactory = fn() -> Box<dyn OpKernel>;

/// Operators the driver can run, by name.
pub struct OpRegistry {
    ops: HashMap<String, OpFactory>,
}

impl Default for OpRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("abs", || -> Box<dyn OpKernel> { Box::new(AbsOp) });
        registry.register("add", || -> Box<dyn OpKernel> { Box::new(AddOp) });
        registry
    }
}

impl OpRegistry {
    pub fn new() -> Self {
        Self {
            ops: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: OpFactory) {
        self.ops.insert(name.to_string(), factory);
    }

    /// A fresh operator instance; each case gets its own.
    pub fn create(&self, name: &str) -> Option<Box<dyn OpKernel>> {
        self.ops.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

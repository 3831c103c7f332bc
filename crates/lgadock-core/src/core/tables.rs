use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TableError {
    #[error("Kernel constant table '{0}' was not supplied")]
    Missing(TableKind),

    #[error("Kernel constant table '{0}' is empty")]
    Empty(TableKind),
}

/// The six constant tables every docking kernel reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    InterIntra,
    IntraContrib,
    Intra,
    RotList,
    Conform,
    Grads,
}

impl TableKind {
    pub const ALL: [TableKind; 6] = [
        TableKind::InterIntra,
        TableKind::IntraContrib,
        TableKind::Intra,
        TableKind::RotList,
        TableKind::Conform,
        TableKind::Grads,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TableKind::InterIntra => "interintra",
            TableKind::IntraContrib => "intracontrib",
            TableKind::Intra => "intra",
            TableKind::RotList => "rotlist",
            TableKind::Conform => "conform",
            TableKind::Grads => "grads",
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Integer tables describing rotatable bonds, consumed by the gradient kernels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotbondTables {
    pub rotbonds: Vec<i32>,
    pub rotbonds_atoms: Vec<i32>,
    pub num_rotating_atoms_per_rotbond: Vec<i32>,
}

/// Immutable, already validated kernel constants for one docking job.
///
/// Table contents are opaque to this crate; they are only sized and handed to
/// the kernels. Cloning shares the underlying bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConstants {
    tables: [Arc<[u8]>; 6],
    rotbonds: Arc<RotbondTables>,
}

impl KernelConstants {
    pub fn builder() -> KernelConstantsBuilder {
        KernelConstantsBuilder::default()
    }

    #[inline]
    pub fn table(&self, kind: TableKind) -> &[u8] {
        &self.tables[kind.index()]
    }

    pub fn rotbonds(&self) -> &RotbondTables {
        &self.rotbonds
    }

    pub fn total_bytes(&self) -> usize {
        let ints = self.rotbonds.rotbonds.len()
            + self.rotbonds.rotbonds_atoms.len()
            + self.rotbonds.num_rotating_atoms_per_rotbond.len();
        self.tables.iter().map(|t| t.len()).sum::<usize>() + ints * size_of::<i32>()
    }
}

#[derive(Default)]
pub struct KernelConstantsBuilder {
    tables: [Option<Arc<[u8]>>; 6],
    rotbonds: RotbondTables,
}

impl KernelConstantsBuilder {
    pub fn table(mut self, kind: TableKind, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.tables[kind.index()] = Some(bytes.into());
        self
    }

    pub fn rotbonds(mut self, rotbonds: RotbondTables) -> Self {
        self.rotbonds = rotbonds;
        self
    }

    pub fn build(self) -> Result<KernelConstants, TableError> {
        for kind in TableKind::ALL {
            match &self.tables[kind.index()] {
                None => return Err(TableError::Missing(kind)),
                Some(bytes) if bytes.is_empty() => return Err(TableError::Empty(kind)),
                Some(_) => {}
            }
        }
        Ok(KernelConstants {
            tables: self
                .tables
                .map(|slot| slot.unwrap_or_else(|| Arc::from(Vec::new()))),
            rotbonds: Arc::new(self.rotbonds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_builder() -> KernelConstantsBuilder {
        TableKind::ALL
            .into_iter()
            .fold(KernelConstants::builder(), |builder, kind| {
                builder.table(kind, vec![kind.index() as u8 + 1; 8])
            })
    }

    #[test]
    fn build_succeeds_when_all_tables_are_present() {
        let constants = full_builder().build().unwrap();
        for kind in TableKind::ALL {
            assert_eq!(constants.table(kind), &[kind.index() as u8 + 1; 8]);
        }
        assert_eq!(constants.total_bytes(), 48);
    }

    #[test]
    fn build_reports_the_first_missing_table() {
        let result = KernelConstants::builder()
            .table(TableKind::InterIntra, vec![1u8])
            .build();
        assert_eq!(result, Err(TableError::Missing(TableKind::IntraContrib)));
    }

    #[test]
    fn build_rejects_empty_tables() {
        let result = full_builder().table(TableKind::Grads, Vec::new()).build();
        assert_eq!(result, Err(TableError::Empty(TableKind::Grads)));
    }

    #[test]
    fn rotbond_tables_count_towards_total_bytes() {
        let constants = full_builder()
            .rotbonds(RotbondTables {
                rotbonds: vec![0, 1, 2, 3],
                rotbonds_atoms: vec![4, 5],
                num_rotating_atoms_per_rotbond: vec![2, 2],
            })
            .build()
            .unwrap();
        assert_eq!(constants.total_bytes(), 48 + 8 * 4);
        assert_eq!(constants.rotbonds().rotbonds_atoms, vec![4, 5]);
    }

    #[test]
    fn clones_share_table_storage() {
        let constants = full_builder().build().unwrap();
        let copy = constants.clone();
        assert!(std::ptr::eq(
            constants.table(TableKind::Conform),
            copy.table(TableKind::Conform)
        ));
    }
}

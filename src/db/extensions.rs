//! Extensions, vector indexes and the versions the coordinator supports.

use std::fmt;
use std::str::FromStr;

use crate::error::CoordinatorError;
use crate::version::{Version, VersionRange};

/// Extensions the application installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseExtension {
    Cube,
    EarthDistance,
    Vector,
    Vectors,
}

impl DatabaseExtension {
    /// Name used in SQL (`CREATE EXTENSION <name>`).
    pub fn sql_name(&self) -> &'static str {
        match self {
            DatabaseExtension::Cube => "cube",
            DatabaseExtension::EarthDistance => "earthdistance",
            DatabaseExtension::Vector => "vector",
            DatabaseExtension::Vectors => "vectors",
        }
    }

    /// Name the extension is packaged and documented under.
    pub fn package_name(&self) -> &'static str {
        match self {
            DatabaseExtension::Cube => "cube",
            DatabaseExtension::EarthDistance => "earthdistance",
            DatabaseExtension::Vector => "pgvector",
            DatabaseExtension::Vectors => "pgvecto.rs",
        }
    }

    pub fn as_vector(&self) -> Option<VectorExtension> {
        match self {
            DatabaseExtension::Vector => Some(VectorExtension::PgVector),
            DatabaseExtension::Vectors => Some(VectorExtension::PgVectoRs),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.package_name())
    }
}

/// The two mutually exclusive vector search backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VectorExtension {
    PgVector,
    #[default]
    PgVectoRs,
}

impl VectorExtension {
    pub fn extension(&self) -> DatabaseExtension {
        match self {
            VectorExtension::PgVector => DatabaseExtension::Vector,
            VectorExtension::PgVectoRs => DatabaseExtension::Vectors,
        }
    }

    pub fn package_name(&self) -> &'static str {
        self.extension().package_name()
    }

    /// Versions the application schema has been verified against.
    pub fn supported_range(&self) -> VersionRange {
        match self {
            VectorExtension::PgVector => {
                VersionRange::new(Version::new(0, 5, 0), Version::new(1, 0, 0))
            }
            VectorExtension::PgVectoRs => {
                VersionRange::new(Version::new(0, 2, 0), Version::new(0, 5, 0))
            }
        }
    }
}

impl FromStr for VectorExtension {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pgvector" => Ok(VectorExtension::PgVector),
            "pgvecto.rs" => Ok(VectorExtension::PgVectoRs),
            other => Err(CoordinatorError::Configuration(format!(
                "unknown vector extension {:?}, expected \"pgvector\" or \"pgvecto.rs\"",
                other
            ))),
        }
    }
}

impl fmt::Display for VectorExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.package_name())
    }
}

/// Lowest server version the schema runs on.
pub const MIN_POSTGRES_VERSION: Version = Version::new(14, 0, 0);

/// HNSW build parameters used for every vector index.
pub const HNSW_EF_CONSTRUCTION: u32 = 300;
pub const HNSW_M: u32 = 16;

/// Approximate nearest neighbour indexes over embedding columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorIndex {
    Clip,
    Face,
}

impl VectorIndex {
    pub const ALL: [VectorIndex; 2] = [VectorIndex::Clip, VectorIndex::Face];

    pub fn name(&self) -> &'static str {
        match self {
            VectorIndex::Clip => "clip_index",
            VectorIndex::Face => "face_index",
        }
    }

    /// Table holding the indexed `embedding` column.
    pub fn table(&self) -> &'static str {
        match self {
            VectorIndex::Clip => "smart_search",
            VectorIndex::Face => "face_search",
        }
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING hnsw (embedding vector_cosine_ops) \
             WITH (ef_construction = {}, m = {})",
            self.name(),
            self.table(),
            HNSW_EF_CONSTRUCTION,
            HNSW_M
        )
    }
}

impl fmt::Display for VectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

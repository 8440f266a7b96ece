use bitflags::bitflags;

/// Optimizer rule category, in fixed processing order.
///
/// Rules in a category may assume that every earlier category has reached its fixpoint.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum Category {
    /// Generic cleanups (drop empty tasks, fold trivial wrappers).
    Common = 0,
    /// Rewrites that prepare the tree for backend specialization.
    PreSpecialize = 1,
    /// Replace abstract tasks by backend-specific ones.
    Specialize = 2,
    /// Cleanups over specialized tasks.
    PostSpecialize = 3,
    /// Insert conversions between buffer kinds.
    Convert = 4,
    /// Flatten the task trees into the submission list.
    Linear = 5,
    /// Whole-list rewrites (merging, reordering).
    List = 6,
}

impl Category {
    /// Number of categories.
    pub const COUNT: usize = 7;

    /// All categories in processing order.
    pub const ALL: [Category; Category::COUNT] = [
        Category::Common,
        Category::PreSpecialize,
        Category::Specialize,
        Category::PostSpecialize,
        Category::Convert,
        Category::Linear,
        Category::List,
    ];

    /// Position in processing order.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Category at `index`, if any.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// When `true`, the category's rules run together as one batch against one snapshot;
    /// otherwise they run one at a time in registration order.
    pub fn simultaneous(self) -> bool {
        matches!(
            self,
            Category::Common | Category::Specialize | Category::List
        )
    }

    /// Single-bit mask of this category.
    pub fn mask(self) -> CategoryMask {
        CategoryMask::from_bits_truncate(1 << self.index())
    }

    /// Mask of every category strictly before this one.
    pub fn below(self) -> CategoryMask {
        CategoryMask::from_bits_truncate((1 << self.index()) - 1)
    }
}

bitflags! {
    /// Set of categories, used for depends-from gates and affected/dirty tracking.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[derive(serde::Serialize, serde::Deserialize)]
    pub struct CategoryMask: u32 {
        /// [`Category::Common`].
        const COMMON          = 1 << 0;
        /// [`Category::PreSpecialize`].
        const PRE_SPECIALIZE  = 1 << 1;
        /// [`Category::Specialize`].
        const SPECIALIZE      = 1 << 2;
        /// [`Category::PostSpecialize`].
        const POST_SPECIALIZE = 1 << 3;
        /// [`Category::Convert`].
        const CONVERT         = 1 << 4;
        /// [`Category::Linear`].
        const LINEAR          = 1 << 5;
        /// [`Category::List`].
        const LIST            = 1 << 6;
    }
}

impl From<Category> for CategoryMask {
    fn from(category: Category) -> Self {
        category.mask()
    }
}

impl FromIterator<Category> for CategoryMask {
    fn from_iter<I: IntoIterator<Item = Category>>(iter: I) -> Self {
        iter.into_iter()
            .fold(CategoryMask::empty(), |acc, c| acc | c.mask())
    }
}

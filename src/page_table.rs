//! Logical-to-physical page ordering for IDB copies.
//!
//! MLC NAND pairs each "upper" page with a "lower" page programmed earlier in the block; a
//! power cut while programming the upper page can corrupt its partner. The boot ROM therefore
//! expects IDB data to live only in the pages that are safe for a given part family, and which
//! pages those are depends on the family's pairing discipline. [PageScheme] names each
//! discipline, and [PageOrderTable] lists, for every logical group of the IDB, the physical page
//! holding it.

/// How many logical groups a [PageOrderTable] maps
pub const PAGE_TABLE_LEN: usize = 512;

/// The page-pairing scheme of a NAND part (the "LSB mode" of the parameter table)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageScheme {
    /// Every page is usable (SLC, or MLC used in SLC mode)
    Identity,

    /// Four pages linear, then page pairs separated by a pair of skipped pages
    Paired4,

    /// Two pages linear, then every odd page
    Odd2,

    /// Six pages linear, then page pairs separated by a pair of skipped pages
    Paired6,

    /// `0..=5, 7, 8`, then page pairs separated by a pair of skipped pages
    Paired8Shifted,

    /// Sixteen pages linear, then every even page
    Even16,

    /// Six pages linear, then page pairs separated by four skipped pages
    Triple6,

    /// Three pages linear, then every odd page
    Odd3,

    /// Sixty-three pages linear, then every odd page
    Odd63,

    /// Eight pages linear, then page pairs separated by a pair of skipped pages
    Paired8,

    /// Four pages linear, then two of every three pages
    ThreeHalves,
}

impl TryFrom<u8> for PageScheme {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Identity),
            1 => Ok(Self::Paired4),
            2 => Ok(Self::Odd2),
            3 => Ok(Self::Paired6),
            4 => Ok(Self::Paired8Shifted),
            5 => Ok(Self::Even16),
            6 => Ok(Self::Triple6),
            9 => Ok(Self::Odd3),
            10 => Ok(Self::Odd63),
            11 => Ok(Self::Paired8),
            12 => Ok(Self::ThreeHalves),
            _ => Err(()),
        }
    }
}

impl From<PageScheme> for u8 {
    fn from(value: PageScheme) -> Self {
        match value {
            PageScheme::Identity => 0,
            PageScheme::Paired4 => 1,
            PageScheme::Odd2 => 2,
            PageScheme::Paired6 => 3,
            PageScheme::Paired8Shifted => 4,
            PageScheme::Even16 => 5,
            PageScheme::Triple6 => 6,
            PageScheme::Odd3 => 9,
            PageScheme::Odd63 => 10,
            PageScheme::Paired8 => 11,
            PageScheme::ThreeHalves => 12,
        }
    }
}

/// `2n - 2` for even `n`, `2n - 3` for odd `n`: runs of two consecutive pages, each run two pages
/// after the previous one. Shifting by `base` moves where the pattern lines up.
fn paired(n: u32, base: u32) -> u32 {
    2 * n - base - (n & 1)
}

impl PageScheme {
    /// Every scheme, in parameter table order
    pub const ALL: [PageScheme; 11] = [
        Self::Identity,
        Self::Paired4,
        Self::Odd2,
        Self::Paired6,
        Self::Paired8Shifted,
        Self::Even16,
        Self::Triple6,
        Self::Odd3,
        Self::Odd63,
        Self::Paired8,
        Self::ThreeHalves,
    ];

    /// The physical page holding logical group `n`
    pub fn physical_page(self, n: u32) -> u32 {
        match self {
            Self::Identity => n,
            Self::Paired4 => match n {
                0..=3 => n,
                _ => paired(n, 2),
            },
            Self::Odd2 => match n {
                0..=1 => n,
                _ => 2 * n - 1,
            },
            Self::Paired6 => match n {
                0..=5 => n,
                _ => paired(n, 4),
            },
            Self::Paired8Shifted => match n {
                0..=5 => n,
                6 => 7,
                7 => 8,
                _ => paired(n, 6),
            },
            Self::Even16 => match n {
                0..=15 => n,
                _ => 2 * n - 16,
            },
            Self::Triple6 => match n {
                0..=5 => n,
                _ => 3 * n - 10 - 2 * (n & 1),
            },
            Self::Odd3 => match n {
                0..=2 => n,
                _ => 2 * n - 3,
            },
            Self::Odd63 => match n {
                0..=62 => n,
                _ => 2 * n - 63,
            },
            Self::Paired8 => match n {
                0..=7 => n,
                _ => paired(n, 6),
            },
            Self::ThreeHalves => match n {
                0..=3 => n,
                _ => n - 1 + n / 2,
            },
        }
    }
}

/// The logical-group to physical-page map for one [PageScheme]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PageOrderTable {
    scheme: PageScheme,
    pages: [u16; PAGE_TABLE_LEN],
}

impl PageOrderTable {
    /// Build the table for `scheme`. This is a pure function of `scheme`.
    pub fn build(scheme: PageScheme) -> Self {
        let pages = std::array::from_fn(|n| {
            let page = scheme.physical_page(n as u32);
            u16::try_from(page).expect("page tables fit in 16 bits")
        });

        Self { scheme, pages }
    }

    pub fn scheme(&self) -> PageScheme {
        self.scheme
    }

    /// The physical page holding logical group `group`
    pub fn page(&self, group: u32) -> u32 {
        self.pages[group as usize].into()
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.pages
    }
}

#[test]
fn test_table_purity() {
    for scheme in PageScheme::ALL {
        assert_eq!(PageOrderTable::build(scheme), PageOrderTable::build(scheme));
    }
}

#[test]
fn test_table_prefixes() {
    let prefix = |scheme| PageOrderTable::build(scheme).as_slice()[..12].to_vec();

    assert_eq!(prefix(PageScheme::Identity), [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    assert_eq!(prefix(PageScheme::Paired4), [0, 1, 2, 3, 6, 7, 10, 11, 14, 15, 18, 19]);
    assert_eq!(prefix(PageScheme::Odd2), [0, 1, 3, 5, 7, 9, 11, 13, 15, 17, 19, 21]);
    assert_eq!(prefix(PageScheme::Paired6), [0, 1, 2, 3, 4, 5, 8, 9, 12, 13, 16, 17]);
    assert_eq!(
        prefix(PageScheme::Paired8Shifted),
        [0, 1, 2, 3, 4, 5, 7, 8, 10, 11, 14, 15]
    );
    assert_eq!(prefix(PageScheme::Triple6), [0, 1, 2, 3, 4, 5, 8, 9, 14, 15, 20, 21]);
    assert_eq!(prefix(PageScheme::Odd3), [0, 1, 2, 3, 5, 7, 9, 11, 13, 15, 17, 19]);
    assert_eq!(prefix(PageScheme::Paired8), [0, 1, 2, 3, 4, 5, 6, 7, 10, 11, 14, 15]);
    assert_eq!(prefix(PageScheme::ThreeHalves), [0, 1, 2, 3, 5, 6, 8, 9, 11, 12, 14, 15]);

    let even16 = PageOrderTable::build(PageScheme::Even16);
    assert_eq!(even16.as_slice()[14..19], [14, 15, 16, 18, 20]);

    let odd63 = PageOrderTable::build(PageScheme::Odd63);
    assert_eq!(odd63.as_slice()[61..66], [61, 62, 63, 65, 67]);
}

#[test]
fn test_table_tails() {
    let last = |scheme| PageOrderTable::build(scheme).page(PAGE_TABLE_LEN as u32 - 1);

    assert_eq!(last(PageScheme::Identity), 511);
    assert_eq!(last(PageScheme::Paired4), 1019);
    assert_eq!(last(PageScheme::Odd2), 1021);
    assert_eq!(last(PageScheme::Paired6), 1017);
    assert_eq!(last(PageScheme::Paired8Shifted), 1015);
    assert_eq!(last(PageScheme::Even16), 1006);
    assert_eq!(last(PageScheme::Triple6), 1521);
    assert_eq!(last(PageScheme::Odd3), 1019);
    assert_eq!(last(PageScheme::Odd63), 959);
    assert_eq!(last(PageScheme::Paired8), 1015);
    assert_eq!(last(PageScheme::ThreeHalves), 765);
}

#[test]
fn test_table_monotonic() {
    // Pages must be programmed in ascending order, so every table must be strictly increasing
    for scheme in PageScheme::ALL {
        let table = PageOrderTable::build(scheme);
        assert_eq!(table.page(0), 0);
        assert!(table.as_slice().windows(2).all(|w| w[0] < w[1]), "{scheme:?}");
    }
}

#[test]
fn test_scheme_ids() {
    for scheme in PageScheme::ALL {
        assert_eq!(PageScheme::try_from(u8::from(scheme)), Ok(scheme));
    }
    assert!(PageScheme::try_from(7).is_err());
    assert!(PageScheme::try_from(8).is_err());
}

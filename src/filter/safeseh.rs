//! SafeSEH table lookup.
//!
//! An x86 image linked with `/SAFESEH` lists the RVAs of all of its legitimate
//! exception handlers, sorted ascending, in a table referenced from its load
//! configuration directory. The OS dispatcher refuses to call a handler inside such an
//! image unless it is listed. [`SafeHandlerFilter`] replays that lookup for the handler
//! at the top of the chain: when the OS would accept it, there is no reason to
//! intercept the exception.
//!
//! Only the table lookup is reproduced. The remaining checks of the OS validation
//! (DEP, handlers on the stack, images without a table) are not, so a handler this
//! filter lets through is guaranteed to be accepted, while one it keeps may or may
//! not have been.

use goblin::pe::{
    data_directories::DataDirectoryType, header::Header, optional_header::MAGIC_64,
};
use log::{debug, trace};

use crate::{
    chain::{ExceptionChain, CHAIN_END},
    filter::DispatchFilter,
    record::{Context, ExceptionRecord},
    Error::{OutOfBounds, SehDisabled},
    Result,
};

/// `DllCharacteristics` bit marking an image that never uses SEH handlers.
pub const IMAGE_DLLCHARACTERISTICS_NO_SEH: u16 = 0x0400;

/// Offset of `SEHandlerTable` inside the x86 load configuration directory.
const SE_HANDLER_TABLE_OFFSET: usize = 0x40;
/// Offset of `SEHandlerCount` inside the x86 load configuration directory.
const SE_HANDLER_COUNT_OFFSET: usize = 0x44;
/// Minimum load configuration size that includes both SafeSEH fields.
const SAFESEH_FIELDS_END: u32 = 0x48;

/// Reads a little-endian `u32` at `offset`, advancing it.
fn read_u32_at(data: &[u8], offset: &mut usize) -> Result<u32> {
    let end = offset.checked_add(4).ok_or(OutOfBounds)?;
    let Some(bytes) = data.get(*offset..end) else {
        return Err(OutOfBounds);
    };
    let Ok(bytes) = bytes.try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(u32::from_le_bytes(bytes))
}

/// A loaded image, addressed by RVA.
///
/// `bytes` is the image as mapped into memory (offset == RVA), starting at `base`. It
/// must cover at least the headers and the load configuration directory; a read past
/// its end yields [`OutOfBounds`].
#[derive(Debug, Clone, Copy)]
pub struct ModuleImage<'a> {
    base: usize,
    bytes: &'a [u8],
}

impl<'a> ModuleImage<'a> {
    /// Creates a view of the image mapped at `base`.
    #[must_use]
    pub fn new(base: usize, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }

    /// The address the image is mapped at.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// The mapped image.
    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Locates the SafeSEH table of the image.
    ///
    /// Returns `None` for images that do not carry a table: PE32+ images, images
    /// without a load configuration, and load configurations that predate the SafeSEH
    /// fields or leave them empty.
    ///
    /// # Errors
    ///
    /// - [`SehDisabled`] if the image declares [`IMAGE_DLLCHARACTERISTICS_NO_SEH`]
    /// - [`crate::Error::GoblinErr`] if the PE headers can not be parsed
    /// - [`OutOfBounds`] if the load configuration or the table lie outside the image
    /// - [`crate::Error::Malformed`] if the image has no optional header
    pub fn safe_handler_table(&self) -> Result<Option<SafeHandlerTable<'a>>> {
        let header = Header::parse(self.bytes)?;
        let Some(optional_header) = header.optional_header else {
            return Err(malformed_error!("Image at {:#x} has no optional header", self.base));
        };

        if optional_header.windows_fields.dll_characteristics & IMAGE_DLLCHARACTERISTICS_NO_SEH
            != 0
        {
            return Err(SehDisabled(self.base));
        }

        if optional_header.standard_fields.magic == MAGIC_64 {
            return Ok(None);
        }

        let Some((_, load_config)) =
            optional_header
                .data_directories
                .dirs()
                .find(|(directory_type, directory)| {
                    *directory_type == DataDirectoryType::LoadConfigTable
                        && directory.virtual_address != 0
                        && directory.size != 0
                })
        else {
            return Ok(None);
        };

        let load_config = load_config.virtual_address as usize;

        let mut offset = load_config;
        let declared_size = read_u32_at(self.bytes, &mut offset)?;
        if declared_size < SAFESEH_FIELDS_END {
            return Ok(None);
        }

        offset = load_config + SE_HANDLER_TABLE_OFFSET;
        let table_va = read_u32_at(self.bytes, &mut offset)?;
        offset = load_config + SE_HANDLER_COUNT_OFFSET;
        let count = read_u32_at(self.bytes, &mut offset)? as usize;

        if table_va == 0 || count == 0 {
            return Ok(None);
        }

        // PE32 virtual addresses are 32 bits wide.
        let start = table_va.wrapping_sub(self.base as u32) as usize;
        let end = count
            .checked_mul(4)
            .and_then(|length| start.checked_add(length))
            .ok_or(OutOfBounds)?;
        let Some(entries) = self.bytes.get(start..end) else {
            return Err(OutOfBounds);
        };

        Ok(Some(SafeHandlerTable { entries }))
    }

    /// Whether the OS would accept `handler` as a SafeSEH handler of this image.
    ///
    /// # Errors
    ///
    /// See [`safe_handler_table`](Self::safe_handler_table).
    pub fn is_safe_handler(&self, handler: usize) -> Result<bool> {
        let Some(table) = self.safe_handler_table()? else {
            return Ok(false);
        };

        let Some(rva) = handler
            .checked_sub(self.base)
            .and_then(|rva| u32::try_from(rva).ok())
        else {
            return Ok(false);
        };

        let found = table.contains(rva);
        trace!(
            "Handler RVA {rva:#x} {} in the SafeSEH table of {:#x} ({} entries)",
            if found { "found" } else { "not found" },
            self.base,
            table.len()
        );
        Ok(found)
    }
}

/// The sorted handler RVAs of an image.
#[derive(Debug, Clone, Copy)]
pub struct SafeHandlerTable<'a> {
    entries: &'a [u8],
}

impl SafeHandlerTable<'_> {
    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() / 4
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The RVA at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<u32> {
        let mut offset = index.checked_mul(4)?;
        read_u32_at(self.entries, &mut offset).ok()
    }

    /// Iterates over the registered RVAs.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    /// Binary search for `rva`.
    ///
    /// The table is required to be sorted; an unsorted table gives unreliable answers,
    /// exactly as it does for the OS.
    #[must_use]
    pub fn contains(&self, rva: u32) -> bool {
        let mut low = 0usize;
        let mut high = self.len();

        while low < high {
            let middle = low + (high - low) / 2;
            let Some(entry) = self.get(middle) else {
                return false;
            };

            match entry.cmp(&rva) {
                std::cmp::Ordering::Less => low = middle + 1,
                std::cmp::Ordering::Greater => high = middle,
                std::cmp::Ordering::Equal => return true,
            }
        }

        false
    }
}

/// Finds the image a code address belongs to.
pub trait ModuleResolver {
    /// The image containing `address`, or `None` for code outside any loaded image.
    fn image_containing(&self, address: usize) -> Option<ModuleImage<'_>>;
}

/// Defers to the OS when the top handler is registered in its image's SafeSEH table.
///
/// Only the newest record is examined, on the assumption that it is the one that
/// handles the exception. Handlers outside every image are always taken over.
#[derive(Debug, Clone, Default)]
pub struct SafeHandlerFilter<R> {
    resolver: R,
}

impl<R: ModuleResolver> SafeHandlerFilter<R> {
    /// Creates a filter resolving images through `resolver`.
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }
}

impl<R: ModuleResolver> DispatchFilter for SafeHandlerFilter<R> {
    fn should_defer<C: ExceptionChain + ?Sized>(
        &self,
        chain: &C,
        _exception: &ExceptionRecord,
        _context: &Context,
    ) -> Result<bool> {
        let head = chain.head();
        // A missing or corrupt head is reported by the dispatcher itself.
        if head == CHAIN_END || !chain.stack_limits().contains_record(head) {
            return Ok(false);
        }

        // SAFETY: the head was validated against the stack limits.
        let handler = unsafe { (*head).handler } as usize;
        let Some(image) = self.resolver.image_containing(handler) else {
            trace!("Handler {handler:#x} is not inside a loaded image");
            return Ok(false);
        };

        let safe = image.is_safe_handler(handler)?;
        if safe {
            debug!(
                "Handler {handler:#x} is registered with the image at {:#x}, deferring",
                image.base()
            );
        }
        Ok(safe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[u32]) -> Vec<u8> {
        entries.iter().flat_map(|entry| entry.to_le_bytes()).collect()
    }

    #[test]
    fn lookup_finds_every_entry() {
        let bytes = table(&[0x1010, 0x1020, 0x1400, 0x2000, 0x2ff0]);
        let table = SafeHandlerTable { entries: &bytes };

        assert_eq!(table.len(), 5);
        for rva in table.iter() {
            assert!(table.contains(rva), "missing {rva:#x}");
        }
        assert!(!table.contains(0x1000));
        assert!(!table.contains(0x1011));
        assert!(!table.contains(0x3000));
    }

    #[test]
    fn lookup_edges() {
        let empty = SafeHandlerTable { entries: &[] };
        assert!(empty.is_empty());
        assert!(!empty.contains(0));

        let bytes = table(&[0x1234]);
        let single = SafeHandlerTable { entries: &bytes };
        assert!(single.contains(0x1234));
        assert!(!single.contains(0x1233));
        assert_eq!(single.get(1), None);
    }

    #[test]
    fn read_past_end() {
        let bytes = [1, 0, 0, 0, 2, 0];
        let mut offset = 0;
        assert_eq!(read_u32_at(&bytes, &mut offset).ok(), Some(1));
        assert_eq!(offset, 4);
        assert!(matches!(read_u32_at(&bytes, &mut offset), Err(OutOfBounds)));
        assert_eq!(offset, 4);

        let mut offset = usize::MAX - 1;
        assert!(matches!(read_u32_at(&bytes, &mut offset), Err(OutOfBounds)));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let image = ModuleImage::new(0x40_0000, &[0u8; 64]);
        assert!(image.safe_handler_table().is_err());
    }
}

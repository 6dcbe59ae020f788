use std::{mem, slice};

use goblin::pe::header::Header;
use windows_sys::Win32::{
    Foundation::HMODULE,
    System::LibraryLoader::{
        GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    },
};

use crate::{
    filter::{ModuleImage, ModuleRange, ModuleResolver},
    Result,
};

/// Every mapped image has at least its first page committed.
const HEADER_PAGE: usize = 0x1000;

/// Base address of the image containing `address`.
pub(super) fn module_base(address: usize) -> Option<usize> {
    // SAFETY: HMODULE is a plain handle value; zero is "no module".
    let mut module: HMODULE = unsafe { mem::zeroed() };
    let found = unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            address as *const u16,
            &mut module,
        )
    };

    let base = module as usize;
    (found != 0 && base != 0).then_some(base)
}

/// `SizeOfImage` of the image mapped at `base`.
///
/// # Safety
///
/// `base` must be the base address of a mapped image.
pub(super) unsafe fn mapped_size(base: usize) -> Result<usize> {
    let headers = slice::from_raw_parts(base as *const u8, HEADER_PAGE);
    let header = Header::parse(headers)?;
    let Some(optional_header) = header.optional_header else {
        return Err(malformed_error!("Image at {:#x} has no optional header", base));
    };

    Ok(optional_header.windows_fields.size_of_image as usize)
}

/// The range of the image containing `address`.
#[cfg_attr(not(feature = "origin-check"), allow(dead_code))]
pub(super) fn module_range(address: usize) -> Option<Result<ModuleRange>> {
    let base = module_base(address)?;
    // SAFETY: the loader just reported an image at `base`.
    Some(unsafe { mapped_size(base) }.map(|size| ModuleRange { base, size }))
}

/// Resolves code addresses against the images loaded in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadedModules;

impl ModuleResolver for LoadedModules {
    fn image_containing(&self, address: usize) -> Option<ModuleImage<'_>> {
        let base = module_base(address)?;
        // SAFETY: the loader just reported an image at `base`, mapped for SizeOfImage.
        let size = unsafe { mapped_size(base) }.ok()?;
        let bytes = unsafe { slice::from_raw_parts(base as *const u8, size) };

        Some(ModuleImage::new(base, bytes))
    }
}

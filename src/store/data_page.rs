//! Trie operations over the paged store.
//!
//! A trie page starts life in leaf mode ([`BottomPage`]): writes land in its
//! local map and spill into a single overflow page. When both are full the
//! page converts to fan-out mode ([`DataPage`]): 16 child buckets indexed by
//! the next nibble, entries pushed down one level at a time as the local map
//! saturates. Every mutation first makes the touched page writable in the
//! current batch, so the descent carries copy-on-write with it.

use crate::data::{NibbleBuf, NibblePath, SlottedArray};

use super::page_header::MODE_FAN_OUT;
use super::paged_db::{BatchContext, DbError, PageSource, Result};
use super::{BottomPage, DataPage, DbAddress, LeafOverflowPage, PageType};

enum Outcome {
    /// The write has been absorbed.
    Done,
    /// Continue one level down, consuming the first nibble of the key.
    Descend(DbAddress),
    /// The page was restructured; re-dispatch on its new shape.
    Retry,
}

/// Writes `(key, value)` into the subtree rooted at `root`, returning the
/// possibly relocated root address. An empty value deletes the key.
pub fn set(
    batch: &mut BatchContext<'_>,
    root: DbAddress,
    key: &NibblePath<'_>,
    value: &[u8],
) -> Result<DbAddress> {
    let root = if root.is_null() {
        if value.is_empty() {
            return Ok(root);
        }
        batch.get_new_page(PageType::Bottom, 0)?.0
    } else {
        batch.ensure_writable(root)?
    };

    let mut addr = root;
    let mut key = *key;
    loop {
        let page_type = batch.get_page(addr)?.header().get_page_type();
        let outcome = match page_type {
            Some(PageType::Data) => fan_out_once(batch, addr, &key, value)?,
            Some(PageType::Bottom) => leaf_once(batch, addr, &key, value)?,
            _ => return Err(DbError::InvalidPageType),
        };
        match outcome {
            Outcome::Done => return Ok(root),
            Outcome::Descend(child) => {
                addr = child;
                key = key.slice_from(1);
            }
            Outcome::Retry => {}
        }
    }
}

/// One pass over a fan-out page; the page at `addr` is already writable.
fn fan_out_once(
    batch: &mut BatchContext<'_>,
    addr: DbAddress,
    key: &NibblePath<'_>,
    value: &[u8],
) -> Result<Outcome> {
    let mut page = DataPage::wrap(batch.get_page(addr)?);
    let level = page.page().header().level;

    // A delete with no child to shadow resolves locally.
    if value.is_empty() {
        let bucket = if key.is_empty() {
            DbAddress::NULL
        } else {
            page.bucket(key.first() as usize)
        };
        if bucket.is_null() {
            page.map_mut().delete(key);
            batch.mark_dirty(addr, page.into_page());
            return Ok(Outcome::Done);
        }
    }

    // Follow a child that is already writable in this batch.
    if !key.is_empty() {
        let child = page.bucket(key.first() as usize);
        if !child.is_null() && batch.was_written(child) {
            return Ok(Outcome::Descend(child));
        }
    }

    if page.map_mut().try_set(key, value) {
        batch.mark_dirty(addr, page.into_page());
        return Ok(Outcome::Done);
    }

    // Page full: push one nibble's entries down a child and retry.
    let mut stats = [0u16; 16];
    page.map().gather_count_stats_first_nibble(&mut stats);

    // Prefer the highest nibble that already has a child to flush into;
    // otherwise open a fresh leaf for the most populated nibble.
    let mut nibble = None;
    for i in (0..16).rev() {
        if stats[i] > 0 && !page.bucket(i).is_null() {
            nibble = Some(i);
            break;
        }
    }
    let nibble = match nibble {
        Some(n) => n,
        None => {
            let mut best = 0;
            for i in 1..16 {
                if stats[i] > stats[best] {
                    best = i;
                }
            }
            if stats[best] == 0 {
                // Nothing can be pushed down; the entry alone cannot fit.
                return Err(DbError::Full);
            }
            best
        }
    };

    let mut child = page.bucket(nibble);
    if child.is_null() {
        child = batch.get_new_page(PageType::Bottom, level + 1)?.0;
        page.set_bucket(nibble, child);
    }
    batch.mark_dirty(addr, page.into_page());

    flush_down(batch, addr, nibble, child)?;
    Ok(Outcome::Retry)
}

/// Reinserts every live entry with first nibble `nibble` one level down,
/// then removes it from the parent map.
fn flush_down(
    batch: &mut BatchContext<'_>,
    parent: DbAddress,
    nibble: usize,
    child: DbAddress,
) -> Result<()> {
    let entries: Vec<(usize, NibbleBuf, Vec<u8>)> = {
        let page = DataPage::wrap(batch.get_page(parent)?);
        let map = page.map();
        map.iter_nibble(nibble as u8)
            .map(|(index, key, value)| (index, key, value.to_vec()))
            .collect()
    };

    let mut child = child;
    for (_, key, value) in &entries {
        child = set(batch, child, &key.as_path().slice_from(1), value)?;
    }

    let mut page = DataPage::wrap(batch.get_page(parent)?);
    page.set_bucket(nibble, child);
    {
        let mut map = page.map_mut();
        // Descending order keeps the indices stable across tail collection.
        for (index, _, _) in entries.iter().rev() {
            map.delete_at(*index);
        }
    }
    batch.mark_dirty(parent, page.into_page());
    Ok(())
}

/// One pass over a leaf page; the page at `addr` is already writable.
fn leaf_once(
    batch: &mut BatchContext<'_>,
    addr: DbAddress,
    key: &NibblePath<'_>,
    value: &[u8],
) -> Result<Outcome> {
    let mut page = BottomPage::wrap(batch.get_page(addr)?);
    let level = page.page().header().level;

    // With no overflow there is nothing an empty value could shadow.
    if value.is_empty() && page.overflow().is_null() {
        page.map_mut().delete(key);
        batch.mark_dirty(addr, page.into_page());
        return Ok(Outcome::Done);
    }

    if page.map_mut().try_set(key, value) {
        batch.mark_dirty(addr, page.into_page());
        return Ok(Outcome::Done);
    }

    // Spill the local map into the overflow page, making room locally.
    let overflow = page.overflow();
    let overflow = if overflow.is_null() {
        batch.get_new_page(PageType::LeafOverflow, level + 1)?.0
    } else {
        batch.ensure_writable(overflow)?
    };
    page.set_overflow(overflow);

    let mut spill = LeafOverflowPage::wrap(batch.get_page(overflow)?);
    {
        let mut src = page.map_mut();
        let mut dst = spill.map_mut();
        src.move_non_empty_keys_to(&mut dst, true);
    }
    batch.mark_dirty(overflow, spill.into_page());

    if page.map_mut().try_set(key, value) {
        batch.mark_dirty(addr, page.into_page());
        return Ok(Outcome::Done);
    }
    batch.mark_dirty(addr, page.into_page());

    // Local and overflow both saturated: fan out and retry.
    promote(batch, addr)?;
    Ok(Outcome::Retry)
}

/// Converts a saturated leaf into a fan-out page.
///
/// The overflow is merged back (local entries shadow it), reclaimed, and a
/// fresh leaf child is seeded for the busiest nibble before the merged
/// entries are reinserted through the normal write path.
fn promote(batch: &mut BatchContext<'_>, addr: DbAddress) -> Result<()> {
    let bottom = BottomPage::wrap(batch.get_page(addr)?);
    let level = bottom.page().header().level;
    let overflow_addr = bottom.overflow();
    debug_assert!(!overflow_addr.is_null());

    let local: Vec<(NibbleBuf, Vec<u8>)> = bottom
        .map()
        .iter()
        .map(|(_, key, value)| (key, value.to_vec()))
        .collect();

    // Keys present locally are stale in the overflow.
    let mut spill = LeafOverflowPage::wrap(batch.get_page(overflow_addr)?);
    {
        let mut map = spill.map_mut();
        for (key, _) in &local {
            map.delete(&key.as_path());
        }
    }
    let merged: Vec<(NibbleBuf, Vec<u8>)> = spill
        .map()
        .iter()
        .map(|(_, key, value)| (key, value.to_vec()))
        .collect();
    batch.register_for_future_reuse(overflow_addr);

    let mut stats = [0u32; 16];
    for (key, _) in merged.iter().chain(local.iter()) {
        if !key.is_empty() {
            stats[key.as_path().first() as usize] += 1;
        }
    }
    let mut target = 0;
    for i in 1..16 {
        if stats[i] > stats[target] {
            target = i;
        }
    }

    // Rewrite this page as an empty fan-out page.
    let mut page = bottom.into_page();
    let mut header = page.header();
    header.page_type = PageType::Data as u8;
    header.metadata = MODE_FAN_OUT;
    page.set_header(header);
    let mut data = DataPage::wrap(page);
    data.reset();
    if stats[target] > 0 {
        let child = batch.get_new_page(PageType::Bottom, level + 1)?.0;
        data.set_bucket(target, child);
    }
    batch.mark_dirty(addr, data.into_page());

    // Overflow entries first, then local ones, so newer writes win.
    for (key, value) in merged.iter().chain(local.iter()) {
        set(batch, addr, &key.as_path(), value)?;
    }
    Ok(())
}

/// Looks up a key in the subtree rooted at `root`.
///
/// Returns the stored bytes; an empty value is a tombstone the caller
/// interprets. Works against any page source, batch or snapshot.
pub fn try_get<S: PageSource>(
    source: &S,
    root: DbAddress,
    key: &NibblePath<'_>,
) -> Result<Option<Vec<u8>>> {
    let mut addr = root;
    let mut key = *key;
    loop {
        if addr.is_null() {
            return Ok(None);
        }
        let page = source.page_at(addr)?;
        match page.header().get_page_type() {
            Some(PageType::Data) => {
                let data = DataPage::wrap(page);
                let map = data.map();
                if let Some(value) = map.try_get(&key) {
                    return Ok(Some(value.to_vec()));
                }
                if key.is_empty() {
                    return Ok(None);
                }
                addr = data.bucket(key.first() as usize);
                key = key.slice_from(1);
            }
            Some(PageType::Bottom) => {
                let bottom = BottomPage::wrap(page);
                let map = bottom.map();
                if let Some(value) = map.try_get(&key) {
                    return Ok(Some(value.to_vec()));
                }
                let overflow = bottom.overflow();
                if overflow.is_null() {
                    return Ok(None);
                }
                let spill = LeafOverflowPage::wrap(source.page_at(overflow)?);
                let map = spill.map();
                return Ok(map.try_get(&key).map(|value| value.to_vec()));
            }
            _ => return Err(DbError::InvalidPageType),
        }
    }
}

/// Deletes every key starting with `prefix` from the subtree rooted at
/// `root`, returning the possibly relocated root.
pub fn delete_by_prefix(
    batch: &mut BatchContext<'_>,
    root: DbAddress,
    prefix: &NibblePath<'_>,
) -> Result<DbAddress> {
    if root.is_null() {
        return Ok(root);
    }
    let root = batch.ensure_writable(root)?;
    delete_prefix_at(batch, root, prefix)?;
    Ok(root)
}

fn delete_prefix_at(
    batch: &mut BatchContext<'_>,
    addr: DbAddress,
    prefix: &NibblePath<'_>,
) -> Result<()> {
    let page = batch.get_page(addr)?;
    match page.header().get_page_type() {
        Some(PageType::Data) => {
            let mut data = DataPage::wrap(page);
            // Recurse into every child the prefix may intersect.
            if prefix.is_empty() {
                for nibble in 0..16 {
                    let child = data.bucket(nibble);
                    if child.is_null() {
                        continue;
                    }
                    let child = batch.ensure_writable(child)?;
                    data.set_bucket(nibble, child);
                    delete_prefix_at(batch, child, &NibblePath::EMPTY)?;
                }
            } else {
                let nibble = prefix.first() as usize;
                let child = data.bucket(nibble);
                if !child.is_null() {
                    let child = batch.ensure_writable(child)?;
                    data.set_bucket(nibble, child);
                    delete_prefix_at(batch, child, &prefix.slice_from(1))?;
                }
            }
            {
                let mut map = data.map_mut();
                delete_matching(&mut map, prefix);
            }
            batch.mark_dirty(addr, data.into_page());
        }
        Some(PageType::Bottom) => {
            let mut bottom = BottomPage::wrap(page);
            {
                let mut map = bottom.map_mut();
                delete_matching(&mut map, prefix);
            }
            let overflow = bottom.overflow();
            if !overflow.is_null() {
                let overflow = batch.ensure_writable(overflow)?;
                bottom.set_overflow(overflow);
                let mut spill = LeafOverflowPage::wrap(batch.get_page(overflow)?);
                {
                    let mut map = spill.map_mut();
                    delete_matching(&mut map, prefix);
                }
                batch.mark_dirty(overflow, spill.into_page());
            }
            batch.mark_dirty(addr, bottom.into_page());
        }
        _ => return Err(DbError::InvalidPageType),
    }
    Ok(())
}

fn delete_matching<B: AsRef<[u8]> + AsMut<[u8]>>(
    map: &mut SlottedArray<B>,
    prefix: &NibblePath<'_>,
) {
    let doomed: Vec<usize> = map
        .iter()
        .filter(|(_, key, _)| {
            let key = key.as_path();
            key.len() >= prefix.len() && key.first_different(prefix) == prefix.len()
        })
        .map(|(index, _, _)| index)
        .collect();
    for index in doomed.into_iter().rev() {
        map.delete_at(index);
    }
}

//! Framebuffer operations and workload synchronization
//!
//! [`full_sync`] runs on the producer thread when a workload is submitted. It
//! walks the framebuffer pairs in order and decides, for each one, which GPU
//! operations must run before its draws: RAM uploads for framebuffers the CPU
//! modified, tile copies for textures read back from earlier render targets,
//! and color/depth reinterpretation for targets last written in the other
//! encoding. Operations are stored on the pair and recorded into the command
//! list around the pair's draw calls by [`record_operations`].

use crate::framebuffer::{FramebufferChange, FramebufferTable, WriteType};
use crate::render_target::{RenderTargetKey, RenderTargetManager, TargetKind, TargetSlot};
use crate::rhi::{GpuCommand, RhiError};
use crate::tile::{self, TileCopy, TileSource};
use crate::workload::Workload;
use hle_core::graphics::PixelSize;
use hle_core::logging::{log, LogCategory, LogLevel};
use hle_core::types::FixedRect;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FramebufferOperation {
    /// Upload RAM rows into the color or depth target.
    WriteChanges {
        write_type: WriteType,
        change: FramebufferChange,
    },
    /// Copy a rendered region into a tile copy target.
    CreateTileCopy(TileCopy),
    /// Convert a target last written as `from` into the `to` encoding.
    Reinterpret {
        address: u32,
        siz: PixelSize,
        width: u32,
        from: WriteType,
        to: WriteType,
        rect: FixedRect,
    },
    /// Make a pair's output visible to later pairs of the workload.
    Synchronize { address: u32, siz: PixelSize, width: u32 },
}

/// Counters reported by [`full_sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub uploads: usize,
    pub tile_copies: usize,
    pub reinterprets: usize,
}

#[allow(clippy::too_many_arguments)]
fn check_image(
    table: &mut FramebufferTable,
    rdram: &[u8],
    address: u32,
    siz: PixelSize,
    width: u32,
    height: u32,
    write_type: WriteType,
    ops: &mut Vec<FramebufferOperation>,
    changes: &mut Vec<FramebufferChange>,
    stats: &mut SyncStats,
) {
    let fb = table.get_or_create(address, siz, width, height);
    let change = fb.check_rdram(rdram);
    // The CPU drew over GPU output: there is no previous frame to blend with.
    fb.interpolation_enabled = change.is_none() || !fb.was_written();
    if let Some(change) = change {
        changes.push(change.clone());
        ops.push(FramebufferOperation::WriteChanges { write_type, change });
        stats.uploads += 1;
    } else if fb.was_written() && fb.last_write_type != write_type {
        ops.push(FramebufferOperation::Reinterpret {
            address,
            siz,
            width,
            from: fb.last_write_type,
            to: write_type,
            rect: fb.last_write_rect,
        });
        stats.reinterprets += 1;
    }
}

/// Resolve tiles, check RDRAM and queue operations for every pair of
/// `workload`, then record the pair's writes into `table`.
pub fn full_sync(workload: &mut Workload, table: &mut FramebufferTable, rdram: &[u8]) -> SyncStats {
    let mut stats = SyncStats::default();
    let timestamp = workload.workload_id;
    let mut changes = Vec::new();
    let mut next_copy = 0u32;

    for index in 0..workload.fb_pairs.len() {
        let mut ops = Vec::new();

        // Texture loads first: they read what earlier pairs rendered.
        let tiles: Vec<usize> = workload.fb_pairs[index]
            .game_calls
            .iter()
            .filter_map(|game_call| workload.draw_data.calls.get(game_call.draw_call)?.tile)
            .collect();
        for tile_index in tiles {
            let load = match (
                workload.draw_data.tiles.get(tile_index),
                workload.draw_data.tile_copies.get(tile_index),
            ) {
                (Some(load), Some(None)) => *load,
                (Some(_), Some(Some(_))) => continue,
                _ => {
                    log(LogCategory::Framebuffer, LogLevel::Debug, || {
                        format!("Draw call samples unknown tile {}", tile_index)
                    });
                    continue;
                }
            };
            let TileSource::Copy {
                address,
                fb_rect,
                tile_rect,
            } = tile::resolve(&load, table)
            else {
                continue;
            };

            let copy = TileCopy {
                address,
                siz: load.siz,
                width: load.width,
                index: next_copy,
                fb_rect,
                tile_rect,
            };
            next_copy += 1;
            if let Some(slot) = workload.draw_data.tile_copies.get_mut(tile_index) {
                *slot = Some(copy);
            }
            ops.push(FramebufferOperation::CreateTileCopy(copy));
            stats.tile_copies += 1;

            let rendered_here = table
                .find(address)
                .is_some_and(|fb| fb.last_write_timestamp == timestamp);
            if rendered_here {
                let producer = workload.fb_pairs[..index].iter_mut().rev().find(|pair| {
                    pair.color_image.is_some_and(|image| image.address == address)
                });
                if let Some(producer) = producer {
                    if !producer.sync_required {
                        producer.sync_required = true;
                        producer.end_fb_operations.push(FramebufferOperation::Synchronize {
                            address,
                            siz: load.siz,
                            width: load.width,
                        });
                    }
                }
            }
        }

        let pair = &workload.fb_pairs[index];
        let height = pair.draw_height();
        let color = pair.color_image;
        let depth = pair.depth_image;
        let color_rect = pair.draw_color_rect;
        let depth_rect = pair.draw_depth_rect;

        if let Some(image) = color {
            check_image(
                table,
                rdram,
                image.address,
                image.siz,
                image.width,
                height,
                WriteType::Color,
                &mut ops,
                &mut changes,
                &mut stats,
            );
            if let Some(depth) = depth.filter(|_| !depth_rect.is_empty()) {
                check_image(
                    table,
                    rdram,
                    depth,
                    PixelSize::Bits16,
                    image.width,
                    height,
                    WriteType::Depth,
                    &mut ops,
                    &mut changes,
                    &mut stats,
                );
            }
            workload.fb_pairs[index].interpolate = table
                .find(image.address)
                .map_or(true, |fb| fb.interpolation_enabled);
            if !color_rect.is_empty() {
                table.record_write(image.address, WriteType::Color, color_rect, timestamp);
            }
            if let Some(depth) = depth.filter(|_| !depth_rect.is_empty()) {
                table.record_write(depth, WriteType::Depth, depth_rect, timestamp);
            }
        }

        workload.fb_pairs[index].start_fb_operations.extend(ops);
    }

    workload.fb_changes.extend(changes);

    log(LogCategory::Framebuffer, LogLevel::Debug, || {
        format!(
            "Workload {} synced: {} uploads, {} tile copies, {} reinterprets",
            timestamp, stats.uploads, stats.tile_copies, stats.reinterprets
        )
    });
    stats
}

fn image_key(address: u32, siz: PixelSize, width: u32, write_type: WriteType) -> RenderTargetKey {
    RenderTargetKey::new(address, width, siz, TargetKind::for_write(write_type))
}

/// Render target key of a tile copy.
pub fn tile_copy_key(copy: &TileCopy) -> RenderTargetKey {
    RenderTargetKey::new(copy.address, copy.width, copy.siz, TargetKind::TileCopy)
        .with_modifier(copy.index)
}

/// Append the GPU commands for `ops` to `commands`. Targets are looked up in
/// `slot`, falling back to the main slot for sources not rendered there.
pub fn record_operations(
    ops: &[FramebufferOperation],
    manager: &mut RenderTargetManager,
    slot: TargetSlot,
    commands: &mut Vec<GpuCommand>,
) -> Result<(), RhiError> {
    for op in ops {
        match op {
            FramebufferOperation::WriteChanges { write_type, change } => {
                let key = image_key(change.address, change.siz, change.width, *write_type);
                let target = manager.get(key, slot, change.width, change.rect.bottom.max(1) as u32)?;
                commands.push(GpuCommand::UploadTexture {
                    target: target.texture,
                    rect: change.rect,
                    siz: change.siz,
                    data: change.data.clone(),
                });
            }
            FramebufferOperation::CreateTileCopy(copy) => {
                let src = manager
                    .find_by_address(copy.address, TargetKind::Color, slot)
                    .or_else(|| {
                        manager.find_by_address(copy.address, TargetKind::Color, TargetSlot::Main)
                    })
                    .map(|target| target.texture);
                let Some(src) = src else {
                    log(LogCategory::Framebuffer, LogLevel::Debug, || {
                        format!("Tile copy source 0x{:06X} has no target", copy.address)
                    });
                    continue;
                };
                let dst = manager
                    .get(
                        tile_copy_key(copy),
                        slot,
                        copy.fb_rect.width(),
                        copy.fb_rect.height(),
                    )?
                    .texture;
                commands.push(GpuCommand::CopyTexture {
                    src,
                    dst,
                    rect: copy.fb_rect,
                    reinterpret: false,
                });
            }
            FramebufferOperation::Reinterpret {
                address,
                siz,
                width,
                from,
                to,
                rect,
            } => {
                let from_kind = TargetKind::for_write(*from);
                let src = manager
                    .find_by_address(*address, from_kind, slot)
                    .filter(|target| target.key.kind == from_kind)
                    .map(|target| target.texture);
                let Some(src) = src else {
                    continue;
                };
                let height = rect.bottom.max(1) as u32;
                let dst = manager
                    .get(image_key(*address, *siz, *width, *to), slot, *width, height)?
                    .texture;
                commands.push(GpuCommand::CopyTexture {
                    src,
                    dst,
                    rect: *rect,
                    reinterpret: true,
                });
            }
            FramebufferOperation::Synchronize {
                address,
                siz,
                width,
            } => {
                let key = image_key(*address, *siz, *width, WriteType::Color);
                if let Some(target) = manager.find(&key, slot) {
                    commands.push(GpuCommand::Barrier {
                        texture: target.texture,
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_target::RenderTargetConfig;
    use crate::rhi::recording::RecordingDevice;
    use crate::tile::LoadTile;
    use crate::workload::{DrawCall, Matrix4};
    use std::sync::Arc;

    fn draw(scissor: FixedRect, tile: Option<usize>) -> DrawCall {
        DrawCall {
            transform: 0,
            vertex_count: 6,
            tile,
            scissor,
            tile_scroll: [0.0, 0.0],
            depth_write: false,
        }
    }

    fn workload(id: u64) -> Workload {
        let mut workload = Workload::new();
        workload.workload_id = id;
        workload.add_transform(1, Matrix4::IDENTITY);
        workload
    }

    #[test]
    fn test_first_sync_uploads_then_dedups() {
        let rdram = vec![0u8; 0x400000];
        let mut table = FramebufferTable::new();

        let mut first = workload(1);
        first.set_color_image(0x100000, PixelSize::Bits16, 320);
        first.add_draw_call(draw(FixedRect::new(0, 0, 320, 240), None));
        let stats = full_sync(&mut first, &mut table, &rdram);
        assert_eq!(stats.uploads, 1);
        assert_eq!(first.fb_changes.len(), 1);
        assert!(matches!(
            first.fb_pairs[0].start_fb_operations[0],
            FramebufferOperation::WriteChanges {
                write_type: WriteType::Color,
                ..
            }
        ));

        let mut second = workload(2);
        second.set_color_image(0x100000, PixelSize::Bits16, 320);
        second.add_draw_call(draw(FixedRect::new(0, 0, 320, 240), None));
        let stats = full_sync(&mut second, &mut table, &rdram);
        assert_eq!(stats.uploads, 0);
        assert!(second.fb_pairs[0].start_fb_operations.is_empty());
    }

    #[test]
    fn test_tile_copy_marks_producer_pair() {
        let rdram = vec![0u8; 0x400000];
        let mut table = FramebufferTable::new();
        let mut workload = workload(1);

        // Pair 0 renders a 64x64 buffer, pair 1 samples it
        workload.set_color_image(0x200000, PixelSize::Bits16, 64);
        workload.add_draw_call(draw(FixedRect::new(0, 0, 64, 64), None));
        workload.set_color_image(0x100000, PixelSize::Bits16, 320);
        let tile = workload.add_tile(LoadTile {
            address: 0x200000,
            width: 64,
            siz: PixelSize::Bits16,
            fmt: 0,
            load_rect: FixedRect::new(0, 0, 32, 32),
            sample_rect: FixedRect::new(0, 0, 32, 32),
            tmem_hash: 0x1234,
        });
        workload.add_draw_call(draw(FixedRect::new(0, 0, 320, 240), Some(tile)));

        let stats = full_sync(&mut workload, &mut table, &rdram);
        assert_eq!(stats.tile_copies, 1);
        assert_eq!(
            workload.draw_data.tile_copies[tile].map(|copy| copy.index),
            Some(0)
        );
        assert!(workload.fb_pairs[0].sync_required);
        assert!(matches!(
            workload.fb_pairs[0].end_fb_operations[0],
            FramebufferOperation::Synchronize {
                address: 0x200000,
                ..
            }
        ));
        assert!(matches!(
            workload.fb_pairs[1].start_fb_operations[0],
            FramebufferOperation::CreateTileCopy(TileCopy { index: 0, .. })
        ));
    }

    #[test]
    fn test_depth_reinterpret_queued() {
        let rdram = vec![0u8; 0x400000];
        let mut table = FramebufferTable::new();
        table.get_or_create(0x100000, PixelSize::Bits16, 320, 240);
        table.check_rdram(0x100000, &rdram);
        table.record_write(0x100000, WriteType::Depth, FixedRect::new(0, 0, 320, 240), 1);

        let mut workload = workload(2);
        workload.set_color_image(0x100000, PixelSize::Bits16, 320);
        workload.add_draw_call(draw(FixedRect::new(0, 0, 320, 240), None));
        let stats = full_sync(&mut workload, &mut table, &rdram);
        assert_eq!(stats.reinterprets, 1);
        assert!(matches!(
            workload.fb_pairs[0].start_fb_operations[0],
            FramebufferOperation::Reinterpret {
                from: WriteType::Depth,
                to: WriteType::Color,
                ..
            }
        ));
        assert_eq!(
            table.find(0x100000).map(|fb| fb.last_write_type),
            Some(WriteType::Color)
        );
    }

    #[test]
    fn test_cpu_drawn_framebuffer_is_not_interpolated() {
        let mut rdram = vec![0u8; 0x400000];
        let mut table = FramebufferTable::new();
        let frame = |id| {
            let mut workload = workload(id);
            workload.set_color_image(0x100000, PixelSize::Bits16, 320);
            workload.add_draw_call(draw(FixedRect::new(0, 0, 320, 240), None));
            workload
        };

        // First read of a never rendered framebuffer
        let mut first = frame(1);
        full_sync(&mut first, &mut table, &rdram);
        assert!(first.fb_pairs[0].interpolate);

        // The CPU writes into what the GPU rendered
        rdram[0x100000 + 640 * 10] = 0x7F;
        let mut second = frame(2);
        let stats = full_sync(&mut second, &mut table, &rdram);
        assert_eq!(stats.uploads, 1);
        assert!(!second.fb_pairs[0].interpolate);

        let mut third = frame(3);
        full_sync(&mut third, &mut table, &rdram);
        assert!(third.fb_pairs[0].interpolate);
    }

    #[test]
    fn test_unknown_tile_is_ignored() {
        let rdram = vec![0u8; 0x400000];
        let mut table = FramebufferTable::new();
        let mut workload = workload(1);
        workload.set_color_image(0x100000, PixelSize::Bits16, 320);
        workload.add_draw_call(draw(FixedRect::new(0, 0, 320, 240), Some(5)));

        let stats = full_sync(&mut workload, &mut table, &rdram);
        assert_eq!(stats.tile_copies, 0);
        assert!(!workload.fb_pairs[0]
            .start_fb_operations
            .iter()
            .any(|op| matches!(op, FramebufferOperation::CreateTileCopy(_))));
    }

    #[test]
    fn test_record_operations_orders_commands() {
        let device = Arc::new(RecordingDevice::new());
        let mut manager = RenderTargetManager::new(device.clone(), RenderTargetConfig::default());
        let source = RenderTargetKey::new(0x200000, 64, PixelSize::Bits16, TargetKind::Color);
        let source_texture = manager.get(source, TargetSlot::Main, 64, 64).unwrap().texture;

        let copy = TileCopy {
            address: 0x200000,
            siz: PixelSize::Bits16,
            width: 64,
            index: 0,
            fb_rect: FixedRect::new(0, 0, 32, 32),
            tile_rect: FixedRect::new(0, 0, 32, 32),
        };
        let ops = vec![
            FramebufferOperation::WriteChanges {
                write_type: WriteType::Color,
                change: FramebufferChange {
                    address: 0x100000,
                    siz: PixelSize::Bits16,
                    width: 16,
                    rect: FixedRect::new(0, 0, 16, 2),
                    data: vec![0; 64],
                },
            },
            FramebufferOperation::CreateTileCopy(copy),
        ];

        let mut commands = Vec::new();
        record_operations(&ops, &mut manager, TargetSlot::Override(0), &mut commands).unwrap();
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0], GpuCommand::UploadTexture { .. }));
        match &commands[1] {
            GpuCommand::CopyTexture {
                src, reinterpret, ..
            } => {
                // Not rendered in the override slot, so the main target is read
                assert_eq!(*src, source_texture);
                assert!(!reinterpret);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(manager
            .find(&tile_copy_key(&copy), TargetSlot::Override(0))
            .is_some());
    }
}

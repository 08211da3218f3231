use prettytable::{self, format, row, Cell, Row, Table};

use crate::orchestrator::{Plan, TilingResult};
use crate::target::{MemoryLevel, PlatformBudget};
use crate::tiling::CoreShape;
use crate::utils::join_into_string;

fn plain_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}

/// Per-axis core assignment, then per-level tile sizes and occupancy.
pub fn plan_table(result: &TilingResult, budget: &PlatformBudget) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["", "Split", "Single", "Tail"]);
    for (name, axis) in result.block.dims.axes() {
        table.add_row(row![name, axis.dim, axis.single, axis.tail]);
    }
    table.add_row(row![
        "cores",
        format!("{} ({})", result.block.used_cores(), result.block.mode),
        "",
        ""
    ]);

    let core = CoreShape::new(&result.problem, &result.block);
    let used = result.tile.footprint(&core);
    let tile = &result.tile;
    let pb = &tile.pingpong;
    let tiles = [
        (MemoryLevel::L0A, format!("{} x k{}", tile.l0.spatial, tile.l0.k), pb.al0),
        (MemoryLevel::L0B, format!("k{} x n{}", tile.l0.k, tile.l0.n), pb.bl0),
        (MemoryLevel::L0C, format!("{} x n{}", tile.l0.spatial, tile.l0.n), pb.cl0),
        (
            MemoryLevel::L1,
            format!(
                "A {} x k{} / B k{} x n{}",
                tile.al1.spatial, tile.al1.k, tile.bl1.k, tile.bl1.n
            ),
            pb.al1.max(pb.bl1),
        ),
        (MemoryLevel::UB, String::new(), pb.ub),
        (MemoryLevel::BT, String::new(), 1),
    ];
    let mut header = Row::empty();
    for title in ["Level", "Tile", "Buffers", "Used", "Capacity"] {
        header.add_cell(Cell::new(title));
    }
    table.add_row(header);
    for (level, desc, depth) in tiles {
        table.add_row(row![
            level,
            desc,
            depth,
            format!("{: >7}", used[level]),
            format!("{: >7}", budget.capacity_of(level))
        ]);
    }
    table.add_row(row!["template", result.template, "", "", ""]);
    table.add_row(row![
        "key",
        format!("{:#012x}", result.dispatch_key),
        "",
        "",
        ""
    ]);
    table.set_format(plain_format());
    table
}

pub fn pprint_plan(plan: &Plan, budget: &PlatformBudget) {
    println!("{} (from {})", plan.result.spec, plan.source);
    plan_table(&plan.result, budget).printstd();
}

pub fn catalog_table(catalog: &[PlatformBudget]) -> Table {
    let mut table = Table::new();
    let mut titles = row!["Target", "Cube", "Vector"];
    for level in MemoryLevel::levels() {
        titles.add_cell(Cell::new(&level.to_string()));
    }
    table.set_titles(titles);
    for budget in catalog {
        let mut r = row![budget.target, budget.cube_cores, budget.vector_cores];
        for (_, bytes) in budget.capacity.levels() {
            r.add_cell(Cell::new(&format!("{: >7}", bytes)));
        }
        table.add_row(r);
    }
    table.set_format(plain_format());
    table
}

/// Lower-case hex, eight bytes per group.
pub fn blob_hex(blob: &[u8]) -> String {
    join_into_string(
        blob.chunks(8)
            .map(|c| c.iter().map(|b| format!("{:02x}", b)).collect::<String>()),
        " ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TilingCache;
    use crate::orchestrator::TilingOrchestrator;
    use crate::shape::ConvBuilder;
    use crate::target::TargetId;
    use std::sync::Arc;

    #[test]
    fn test_plan_table_lists_every_level() {
        let budget = PlatformBudget::for_target(TargetId::Cube8);
        let plan = TilingOrchestrator::new(budget)
            .with_cache(Arc::new(TilingCache::default()))
            .plan(&ConvBuilder::forward(1, 32, 32, [1, 16, 16], [1, 3, 3]).build())
            .unwrap();
        let table = plan_table(&plan.result, budget);
        // Five axes, cores, level header, six levels, template and key.
        assert_eq!(table.len(), 5 + 1 + 1 + 6 + 2);
    }

    #[test]
    fn test_catalog_table_has_a_row_per_target() {
        assert_eq!(
            catalog_table(PlatformBudget::catalog()).len(),
            PlatformBudget::catalog().len()
        );
    }

    #[test]
    fn test_blob_hex_groups_by_eight() {
        assert_eq!(blob_hex(&[0, 1, 2, 3, 4, 5, 6, 7, 255]), "0001020304050607 ff");
    }
}

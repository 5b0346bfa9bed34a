//! Displays the metadata a system action can read from its batch.

use slate_engine::{SystemKind, World};

fn main() {
    let mut world = World::new();

    let position = world.register_component("Position", 8);
    let speed = world.register_component("Speed", 4);
    let object = world
        .declare_family("Object", &[position, speed])
        .expect("components are registered");

    world
        .new_system("Metadata", SystemKind::OnFrame, "Position, Speed", |batch| {
            println!("delta_time = {}", batch.delta_time());
            println!("row stride = {} bytes", batch.stride());
            for column in 0..batch.column_count() {
                println!(
                    "column {column}: component {:?} at offset {}",
                    batch.component(column),
                    batch.columns()[column]
                );
            }
            for row in 0..batch.row_count() {
                println!("process entity {:?}", batch.entity(row));
            }
        })
        .expect("signature resolves");

    world.new_entity(object).expect("family is declared");

    world.progress(0.5);
}

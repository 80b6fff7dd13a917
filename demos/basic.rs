use std::{alloc::Layout, ptr::NonNull};

use memarena::{Allocator, MemoryConfig, MemoryContext, PowAllocator, typed};

fn log_alloc(addr: NonNull<u8>, layout: Layout) {
    println!("Requested {} bytes of memory", layout.size());
    println!("Received this address: {addr:?}");
}

#[derive(Debug, Default)]
struct Particle {
    position: [f32; 3],
    name: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut small_objects = PowAllocator::new()?;

    let l1 = Layout::new::<u64>();
    let addr1 = small_objects.allocate(l1)?;
    log_alloc(addr1, l1);

    let l2 = Layout::array::<u8>(8)?;
    let addr2 = small_objects.allocate(l2)?;
    log_alloc(addr2, l2);

    let l3 = Layout::array::<u8>(1000)?;
    let addr3 = small_objects.allocate(l3)?;
    log_alloc(addr3, l3);

    for class in small_objects.classes().iter().filter(|class| class.live > 0) {
        println!("{class:?}");
    }

    unsafe {
        small_objects.deallocate(addr1);
        small_objects.deallocate(addr2);
        small_objects.deallocate(addr3);
    }

    let mut context = MemoryContext::new(MemoryConfig::default())?;
    let handles = context.handles();

    let particles = typed::new_array_with(handles.heap, 4, |i| Particle {
        position: [i as f32; 3],
        name: format!("particle-{i}"),
    })?;
    let forgotten = typed::new(handles.heap, Particle::default())?;

    unsafe {
        println!("{} particles, last one {:?}", typed::array_len(particles).unwrap_or(0), particles.add(3).as_ref());
        typed::free_array(handles.heap, particles);
    }
    println!("never freed: {:?}", unsafe { forgotten.as_ref() });

    let report = context.shutdown();
    print!("{report}");

    Ok(())
}

// ============================================================================
// state_io.rs — slime-engine
// Binary snapshot save/load of the trail field and agent population.
// ============================================================================

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::agent::Agent;

const MAGIC: &[u8; 8] = b"SLMSNP01";

/// Upper bound on the agent count accepted from a file, so a corrupt length
/// prefix can't trigger a huge allocation.
const MAX_SNAPSHOT_AGENTS: usize = 1 << 26;

/// Field texels plus population at one tick.
#[derive(Clone, Debug, PartialEq)]
pub struct SimSnapshot {
    pub width: u32,
    pub height: u32,
    pub tick: u64,
    /// Simulated seconds at `tick`.
    pub sim_time: f64,
    pub texels: Vec<[f32; 4]>,
    pub agents: Vec<Agent>,
}

pub fn save_snapshot<P: AsRef<Path>>(path: P, snapshot: &SimSnapshot) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    write_snapshot(&mut file, snapshot)?;
    file.flush()
}

/// Load a snapshot and check it was taken on a `width` x `height` field.
pub fn load_snapshot<P: AsRef<Path>>(path: P, width: u32, height: u32) -> io::Result<SimSnapshot> {
    let mut file = BufReader::new(File::open(path)?);
    read_snapshot(&mut file, width, height)
}

pub fn write_snapshot<W: Write>(out: &mut W, snapshot: &SimSnapshot) -> io::Result<()> {
    out.write_all(MAGIC)?;
    out.write_all(&snapshot.width.to_le_bytes())?;
    out.write_all(&snapshot.height.to_le_bytes())?;
    out.write_all(&snapshot.tick.to_le_bytes())?;
    out.write_all(&snapshot.sim_time.to_le_bytes())?;

    let flat: Vec<f32> = snapshot.texels.iter().flatten().copied().collect();
    write_vec_f32(out, &flat)?;

    out.write_all(&(snapshot.agents.len() as u64).to_le_bytes())?;
    for agent in &snapshot.agents {
        out.write_all(&agent.position[0].to_le_bytes())?;
        out.write_all(&agent.position[1].to_le_bytes())?;
        out.write_all(&agent.angle.to_le_bytes())?;
        out.write_all(&agent.species_index.to_le_bytes())?;
        for m in agent.species_mask {
            out.write_all(&m.to_le_bytes())?;
        }
    }
    Ok(())
}

pub fn read_snapshot<R: Read>(input: &mut R, width: u32, height: u32) -> io::Result<SimSnapshot> {
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(invalid("invalid snapshot magic"));
    }

    let file_width = read_u32(input)?;
    let file_height = read_u32(input)?;
    if file_width != width || file_height != height {
        return Err(invalid(format!(
            "snapshot dimensions {}x{} incompatible with field {}x{}",
            file_width, file_height, width, height
        )));
    }
    let tick = read_u64(input)?;
    let sim_time = f64::from_bits(read_u64(input)?);

    let cells = width as usize * height as usize;
    let flat = read_vec_f32(input, cells * 4)?;
    let texels = flat
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect();

    let count = read_u64(input)? as usize;
    if count > MAX_SNAPSHOT_AGENTS {
        return Err(invalid(format!("snapshot claims {count} agents")));
    }
    let mut agents = Vec::with_capacity(count);
    for _ in 0..count {
        let x = read_f32(input)?;
        let y = read_f32(input)?;
        let angle = read_f32(input)?;
        let species_index = read_u32(input)?;
        let mut mask = [0i32; 3];
        for m in &mut mask {
            *m = read_u32(input)? as i32;
        }
        let agent = Agent::new([x, y], angle, species_index, mask);
        if !agent.has_consistent_mask() {
            return Err(invalid(format!(
                "agent species index {species_index} does not match mask {mask:?}"
            )));
        }
        agents.push(agent);
    }

    Ok(SimSnapshot {
        width,
        height,
        tick,
        sim_time,
        texels,
        agents,
    })
}

fn invalid<E: Into<Box<dyn std::error::Error + Send + Sync>>>(msg: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn write_vec_f32<W: Write>(out: &mut W, values: &[f32]) -> io::Result<()> {
    let len = values.len() as u64;
    out.write_all(&len.to_le_bytes())?;
    for value in values {
        out.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_vec_f32<R: Read>(input: &mut R, expected: usize) -> io::Result<Vec<f32>> {
    let len = read_u64(input)? as usize;
    if len != expected {
        return Err(invalid(format!("field holds {len} values, expected {expected}")));
    }
    let mut bytes = vec![0u8; len * std::mem::size_of::<f32>()];
    input.read_exact(&mut bytes)?;
    let mut values = Vec::with_capacity(len);
    for chunk in bytes.chunks_exact(4) {
        values.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(values)
}

fn read_u32<R: Read>(input: &mut R) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64<R: Read>(input: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_f32<R: Read>(input: &mut R) -> io::Result<f32> {
    Ok(f32::from_bits(read_u32(input)?))
}

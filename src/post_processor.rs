use std::io::Write;

use log::info;

use crate::{
    datatypes::Point,
    error::{FemError, Result},
    mesh::Mesh,
};

const AXES: [&str; 3] = ["x", "y", "z"];

/// Outcome of looking up one query point after the solve
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<const D: usize> {
    pub point: Point<D>,
    pub element: Option<usize>,
    pub displacement: Option<Point<D>>,
}

fn create_file(path: &str) -> Result<std::fs::File> {
    match std::fs::File::create(path) {
        Ok(f) => Ok(f),
        Err(err) => Err(FemError::PostProcessor(format!(
            "Failed to create {path}: {err}"
        ))),
    }
}

fn write_line(file: &mut impl Write, path: &str, line: String) -> Result<()> {
    match writeln!(file, "{line}") {
        Ok(()) => Ok(()),
        Err(err) => Err(FemError::PostProcessor(format!(
            "Failed to write to {path}: {err}"
        ))),
    }
}

fn header<const D: usize>(prefix: &str) -> Vec<String> {
    AXES.iter().take(D).map(|a| format!("{prefix}{a}")).collect()
}

fn join_point<const D: usize>(point: &Point<D>) -> Vec<String> {
    point.iter().map(|v| v.to_string()).collect()
}

/// Writes node positions and displacements to a CSV file
///
/// # Arguments
/// * `mesh` - The post-solve mesh
/// * `nodes_output` - The filename of the output nodes csv
pub fn csv_output<const D: usize>(mesh: &Mesh<D>, nodes_output: &str) -> Result<()> {
    let mut nodes_file = create_file(nodes_output)?;

    let mut columns = header::<D>("");
    columns.extend(header::<D>("u"));
    write_line(&mut nodes_file, nodes_output, columns.join(","))?;

    for node in mesh.nodes.iter() {
        let mut row = join_point(&node.position);
        row.extend(join_point(&node.displacement()));
        write_line(&mut nodes_file, nodes_output, row.join(","))?;
    }

    info!("wrote {} nodes to {}", mesh.nodes.len(), nodes_output);
    Ok(())
}

/// Writes query lookups to a CSV file. Points outside the mesh leave the
/// element and displacement columns empty.
pub fn query_output<const D: usize>(queries: &[QueryResult<D>], queries_output: &str) -> Result<()> {
    let mut queries_file = create_file(queries_output)?;

    let mut columns = header::<D>("");
    columns.push("element".to_owned());
    columns.extend(header::<D>("u"));
    write_line(&mut queries_file, queries_output, columns.join(","))?;

    for query in queries.iter() {
        let mut row = join_point(&query.point);
        row.push(query.element.map_or(String::new(), |e| e.to_string()));
        match &query.displacement {
            Some(u) => row.extend(join_point(u)),
            None => row.extend(std::iter::repeat(String::new()).take(D)),
        }
        write_line(&mut queries_file, queries_output, row.join(","))?;
    }

    info!("wrote {} queries to {}", queries.len(), queries_output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn scratch(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("lodestone-{}-{}", std::process::id(), name))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn nodes_csv_lists_displacements() {
        let mut mesh: Mesh<2> = Mesh::new();
        mesh.add_node(Vector2::new(0.0, 1.0), 2);
        mesh.nodes[0].solution = vec![0.5, -2.0];

        let path = scratch("nodes.csv");
        csv_output(&mesh, &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(contents, "x,y,ux,uy\n0,1,0.5,-2\n");
    }

    #[test]
    fn missed_queries_leave_blank_columns() {
        let queries = vec![
            QueryResult {
                point: Vector2::new(0.25, 0.5),
                element: Some(3),
                displacement: Some(Vector2::new(1.0, 0.0)),
            },
            QueryResult {
                point: Vector2::new(9.0, 9.0),
                element: None,
                displacement: None,
            },
        ];

        let path = scratch("queries.csv");
        query_output(&queries, &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            contents,
            "x,y,element,ux,uy\n0.25,0.5,3,1,0\n9,9,,,\n"
        );
    }

    #[test]
    fn unwritable_path_is_reported() {
        let mesh: Mesh<1> = Mesh::new();
        assert!(matches!(
            csv_output(&mesh, "/nonexistent-dir/nodes.csv"),
            Err(FemError::PostProcessor(_))
        ));
    }
}
